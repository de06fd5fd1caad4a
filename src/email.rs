use lettre::{
    message::Mailbox,
    transport::smtp::{authentication::Credentials, response::Response as LettreResponse},
    Address, AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum MailError {
    #[error("email is not configured on this server")]
    Disabled,
    #[error("invalid email address: {0}")]
    Address(#[from] lettre::address::AddressError),
    #[error("failed to build email: {0}")]
    Build(#[from] lettre::error::Error),
    #[error("failed to send email: {0}")]
    Transport(#[from] lettre::transport::smtp::Error),
    #[error("invalid frontend url: {0}")]
    Url(#[from] url::ParseError),
}

#[derive(Clone)]
pub struct Mailer {
    transport: Option<AsyncSmtpTransport<Tokio1Executor>>,
    from: Option<Mailbox>,
    frontend_host: Url,
}

impl Mailer {
    pub fn new(
        smtp_host: Option<&str>,
        username: Option<&str>,
        password: Option<&str>,
        frontend_host: &str,
    ) -> Result<Self, MailError> {
        let frontend_host = Url::parse(frontend_host)?;
        let (Some(host), Some(username), Some(password)) = (smtp_host, username, password) else {
            tracing::warn!("SMTP is not configured, outgoing email is disabled");
            return Ok(Self::disabled_with_host(frontend_host));
        };

        let address = username.parse::<Address>()?;
        let transport = AsyncSmtpTransport::<Tokio1Executor>::relay(host)?
            .credentials(Credentials::new(username.to_string(), password.to_string()))
            .build();

        Ok(Self {
            transport: Some(transport),
            from: Some(Mailbox::new(Some("Zenith".to_string()), address)),
            frontend_host,
        })
    }

    fn disabled_with_host(frontend_host: Url) -> Self {
        Self {
            transport: None,
            from: None,
            frontend_host,
        }
    }

    pub fn disabled(frontend_host: &str) -> Result<Self, MailError> {
        Ok(Self::disabled_with_host(Url::parse(frontend_host)?))
    }

    pub fn is_enabled(&self) -> bool {
        self.transport.is_some()
    }

    pub fn link(&self, path: &str) -> Result<Url, MailError> {
        Ok(self.frontend_host.join(path)?)
    }

    /// Makes sure the relay accepts our credentials.
    pub async fn sanity_check(&self) -> Result<bool, MailError> {
        match &self.transport {
            Some(transport) => Ok(transport.test_connection().await?),
            None => Err(MailError::Disabled),
        }
    }

    pub async fn send(
        &self,
        to_name: &str,
        to_email: &str,
        subject: &str,
        body: String,
    ) -> Result<LettreResponse, MailError> {
        let (Some(transport), Some(from)) = (&self.transport, &self.from) else {
            return Err(MailError::Disabled);
        };

        let destination = to_email.parse::<Address>()?;
        let email = Message::builder()
            .from(from.clone())
            .to(Mailbox::new(Some(to_name.to_string()), destination))
            .subject(subject)
            .body(body)?;

        let response = transport.send(email).await?;
        tracing::info!(to = to_email, subject, "sent email");
        Ok(response)
    }
}

pub fn welcome_body(name: &str, email: &str, club_name: &str, link: &Url) -> String {
    format!(
        r#"Hi {name},

Welcome to Zenith! You have been set up as the coordinator of {club_name}. To finish setting up your account, open the link below to choose a password, then sign in with "{email}" and your new password.

{link}

This link will expire in 7 days (or when the server restarts). If you need a new link, use the "Forgot your password?" link on the login page.

Thanks,
The Zenith Team."#
    )
}

pub fn password_reset_body(name: &str, minutes: u64, link: &Url) -> String {
    format!(
        r"Hi {name},

We have received a request to change your Zenith password. To reset your password, please open the link below within the next {minutes} minutes (or paste it into your browser if clicking is not working):

{link}

If you did not request this password reset you can disregard this message and your password will remain unchanged.

Thanks,
The Zenith Team."
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disabled_mailer_refuses_to_send() {
        let mailer = Mailer::new(None, None, None, "http://localhost:3000").unwrap();
        assert!(!mailer.is_enabled());
        assert!(matches!(
            mailer
                .send("Ada", "ada@college.edu", "hi", "body".to_string())
                .await,
            Err(MailError::Disabled)
        ));
    }

    #[test]
    fn links_are_joined_onto_the_frontend() {
        let mailer = Mailer::disabled("https://zenith.example.edu").unwrap();
        assert_eq!(
            mailer.link("reset-password/abc").unwrap().as_str(),
            "https://zenith.example.edu/reset-password/abc"
        );
    }

    #[test]
    fn reset_body_mentions_deadline() {
        let link = Url::parse("https://zenith.example.edu/reset-password/xyz").unwrap();
        let body = password_reset_body("Ada", 60, &link);
        assert!(body.contains("60 minutes"));
        assert!(body.contains("reset-password/xyz"));
    }
}
