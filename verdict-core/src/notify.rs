//! Fire-and-forget completion and error notifications.

use crate::config::NotificationConfig;
use crate::error::{ConfigError, NotifyError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Completed,
    Failed,
}

/// A message to a single recipient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub to: String,
    pub subject: String,
    pub body: String,
    pub kind: NotificationKind,
}

impl Notification {
    pub fn completed(to: &str, query: &str, body: impl Into<String>) -> Self {
        Self {
            to: to.to_string(),
            subject: format!("Research complete: {}", shorten(query, 80)),
            body: body.into(),
            kind: NotificationKind::Completed,
        }
    }

    pub fn failed(to: &str, query: &str, error: &str) -> Self {
        Self {
            to: to.to_string(),
            subject: format!("Research failed: {}", shorten(query, 80)),
            body: format!("The research for \"{query}\" stopped with an error:\n\n{error}"),
            kind: NotificationKind::Failed,
        }
    }
}

fn shorten(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max).collect();
        format!("{cut}...")
    }
}

/// Delivers notifications.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError>;
}

/// Writes notifications to the log instead of sending them.
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        info!(
            to = %notification.to,
            kind = ?notification.kind,
            subject = %notification.subject,
            "Notification"
        );
        Ok(())
    }
}

/// Sends mail through an SMTP relay using STARTTLS.
pub struct SmtpNotifier {
    host: String,
    port: u16,
    username: String,
    password: String,
    from_address: String,
}

impl SmtpNotifier {
    /// Build from config, reading the password from `config.password_env`.
    pub fn from_config(config: &NotificationConfig) -> Result<Self, ConfigError> {
        let password =
            std::env::var(&config.password_env).map_err(|_| ConfigError::EnvVarMissing {
                var: config.password_env.clone(),
            })?;
        if config.from_address.trim().is_empty() {
            return Err(ConfigError::Invalid {
                message: "notifications.from_address is empty".to_string(),
            });
        }
        Ok(Self {
            host: config.smtp_host.clone(),
            port: config.smtp_port,
            username: config.username.clone(),
            password,
            from_address: config.from_address.clone(),
        })
    }
}

#[async_trait]
impl Notifier for SmtpNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        let email = lettre::Message::builder()
            .from(
                self.from_address
                    .parse()
                    .map_err(|e| NotifyError::InvalidAddress {
                        address: self.from_address.clone(),
                        message: format!("{e}"),
                    })?,
            )
            .to(notification
                .to
                .parse()
                .map_err(|e| NotifyError::InvalidAddress {
                    address: notification.to.clone(),
                    message: format!("{e}"),
                })?)
            .subject(notification.subject.clone())
            .body(notification.body.clone())
            .map_err(|e| NotifyError::Delivery {
                message: format!("Failed to build email: {e}"),
            })?;

        let creds = lettre::transport::smtp::authentication::Credentials::new(
            self.username.clone(),
            self.password.clone(),
        );
        let mailer = lettre::AsyncSmtpTransport::<lettre::Tokio1Executor>::starttls_relay(&self.host)
            .map_err(|e| NotifyError::Delivery {
                message: format!("SMTP relay error: {e}"),
            })?
            .port(self.port)
            .credentials(creds)
            .build();

        use lettre::AsyncTransport;
        let response = mailer.send(email).await.map_err(|e| NotifyError::Delivery {
            message: format!("SMTP send error: {e}"),
        })?;
        info!(to = %notification.to, code = %response.code(), "Notification sent");
        Ok(())
    }
}

/// Deliver a notification, logging (never returning) any failure.
pub async fn notify_quietly(notifier: &dyn Notifier, notification: Notification) {
    if let Err(e) = notifier.notify(&notification).await {
        warn!(to = %notification.to, error = %e, "Notification delivery failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Broken;

    #[async_trait]
    impl Notifier for Broken {
        async fn notify(&self, _n: &Notification) -> Result<(), NotifyError> {
            Err(NotifyError::Delivery {
                message: "relay down".into(),
            })
        }
    }

    #[test]
    fn test_subject_is_shortened() {
        let query = "q".repeat(200);
        let n = Notification::completed("a@b.ro", &query, "done");
        assert!(n.subject.len() < 110);
        assert!(n.subject.ends_with("..."));
        assert_eq!(n.kind, NotificationKind::Completed);
    }

    #[test]
    fn test_failed_body_contains_error() {
        let n = Notification::failed("a@b.ro", "furt", "timeout");
        assert!(n.body.contains("timeout"));
        assert_eq!(n.kind, NotificationKind::Failed);
    }

    #[tokio::test]
    async fn test_notify_quietly_swallows_errors() {
        notify_quietly(&Broken, Notification::failed("a@b.ro", "q", "e")).await;
        notify_quietly(&LogNotifier, Notification::completed("a@b.ro", "q", "ok")).await;
    }

    #[test]
    fn test_smtp_requires_password_env() {
        let config = NotificationConfig {
            password_env: "VERDICT_TEST_SMTP_PASSWORD_NEVER_SET".into(),
            from_address: "verdict@example.com".into(),
            ..Default::default()
        };
        assert!(matches!(
            SmtpNotifier::from_config(&config),
            Err(ConfigError::EnvVarMissing { .. })
        ));
    }
}
