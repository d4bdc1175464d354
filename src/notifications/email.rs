//! SMTP delivery and the account emails the portal sends.

use anyhow::Result;
use async_trait::async_trait;
use lettre::{
    message::{header::ContentType, Mailbox, MultiPart, SinglePart},
    transport::smtp::authentication::Credentials,
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};

use super::Mailer;
use crate::config::EmailConfig;

/// A rendered email, ready for any [`Mailer`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailMessage {
    pub subject: String,
    pub html: String,
    pub text: String,
}

impl EmailMessage {
    pub async fn send(&self, mailer: &dyn Mailer, to: &str) -> bool {
        mailer.send_message(to, &self.subject, &self.html, &self.text).await
    }
}

/// Mailer backed by an SMTP relay
pub struct SmtpMailer {
    config: EmailConfig,
}

impl SmtpMailer {
    pub fn new(config: EmailConfig) -> Self {
        Self { config }
    }

    /// Check if email sending is configured and enabled
    pub fn is_enabled(&self) -> bool {
        self.config.is_configured()
    }

    /// Send an email with HTML and plain text versions
    async fn send_email(
        &self,
        to_email: &str,
        subject: &str,
        html_body: &str,
        text_body: &str,
    ) -> Result<()> {
        let smtp_host = self
            .config
            .smtp_host
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("SMTP host not configured"))?;
        let from_address = self
            .config
            .from_address
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("From address not configured"))?;

        let from_mailbox = format!("{} <{}>", self.config.from_name, from_address);
        let from: Mailbox = from_mailbox.parse()?;
        let to: Mailbox = to_email.parse()?;

        let email = Message::builder()
            .from(from)
            .to(to)
            .subject(subject)
            .multipart(
                MultiPart::alternative()
                    .singlepart(
                        SinglePart::builder()
                            .header(ContentType::TEXT_PLAIN)
                            .body(text_body.to_string()),
                    )
                    .singlepart(
                        SinglePart::builder()
                            .header(ContentType::TEXT_HTML)
                            .body(html_body.to_string()),
                    ),
            )?;

        let mailer = if self.config.smtp_tls {
            AsyncSmtpTransport::<Tokio1Executor>::relay(smtp_host)?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(smtp_host)
        }
        .port(self.config.smtp_port)
        .timeout(Some(self.config.send_timeout()));

        let mailer = if let (Some(username), Some(password)) =
            (&self.config.smtp_username, &self.config.smtp_password)
        {
            mailer.credentials(Credentials::new(username.clone(), password.clone()))
        } else {
            mailer
        };

        mailer.build().send(email).await?;
        Ok(())
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send_message(&self, to: &str, subject: &str, html: &str, text: &str) -> bool {
        if !self.is_enabled() {
            tracing::warn!(to = %to, subject = %subject, "Email not configured, message not delivered");
            return false;
        }

        match tokio::time::timeout(
            self.config.send_timeout(),
            self.send_email(to, subject, html, text),
        )
        .await
        {
            Ok(Ok(())) => {
                tracing::info!(to = %to, subject = %subject, "Email sent successfully");
                true
            }
            Ok(Err(e)) => {
                tracing::error!(to = %to, subject = %subject, error = %e, "Email delivery failed");
                false
            }
            Err(_) => {
                tracing::error!(to = %to, subject = %subject, "Email delivery timed out");
                false
            }
        }
    }
}

// -------------------------------------------------------------------------
// Templates
// -------------------------------------------------------------------------

fn wrap_html(title: &str, body: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="utf-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <title>{title}</title>
    <style>
        body {{
            font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, Arial, sans-serif;
            margin: 0;
            padding: 0;
            background-color: #f5f5f5;
        }}
        .container {{
            max-width: 560px;
            margin: 0 auto;
            padding: 40px 20px;
        }}
        .card {{
            background-color: #ffffff;
            border-radius: 8px;
            box-shadow: 0 2px 8px rgba(0, 0, 0, 0.06);
            padding: 32px 24px;
        }}
        .card p {{
            margin: 0 0 16px;
            color: #374151;
            line-height: 1.6;
        }}
        .code {{
            font-size: 28px;
            letter-spacing: 6px;
            font-weight: 600;
            text-align: center;
            background-color: #f3f4f6;
            border-radius: 6px;
            padding: 16px;
            margin: 20px 0;
        }}
        .button {{
            display: inline-block;
            background-color: #2563eb;
            color: white !important;
            text-decoration: none;
            padding: 14px 32px;
            border-radius: 6px;
            font-weight: 500;
        }}
        .note {{
            color: #6b7280;
            font-size: 13px;
        }}
    </style>
</head>
<body>
    <div class="container">
        <div class="card">
            <h1>{title}</h1>
{body}
        </div>
    </div>
</body>
</html>"#,
        title = html_escape(title),
        body = body,
    )
}

/// One-time code sent after registration or on resend
pub fn render_verification_code(first_name: &str, code: &str, ttl_minutes: i64) -> EmailMessage {
    let subject = "Verify your email address".to_string();
    let html = wrap_html(
        &subject,
        &format!(
            r#"            <p>Hi {name},</p>
            <p>Use this code to confirm your email address:</p>
            <div class="code">{code}</div>
            <p class="note">The code expires in {ttl} minutes. Your account still needs administrator approval after you verify.</p>"#,
            name = html_escape(first_name),
            code = html_escape(code),
            ttl = ttl_minutes,
        ),
    );
    let text = format!(
        "Hi {first_name},\n\nYour verification code is: {code}\n\nThe code expires in {ttl_minutes} minutes. \
         Your account still needs administrator approval after you verify."
    );
    EmailMessage { subject, html, text }
}

/// Login second factor
pub fn render_two_factor_code(code: &str, ttl_minutes: i64) -> EmailMessage {
    let subject = "Your login code".to_string();
    let html = wrap_html(
        &subject,
        &format!(
            r#"            <p>Someone is signing in to your account. Enter this code to finish:</p>
            <div class="code">{code}</div>
            <p class="note">The code expires in {ttl} minutes. If this wasn't you, change your password.</p>"#,
            code = html_escape(code),
            ttl = ttl_minutes,
        ),
    );
    let text = format!(
        "Your login code is: {code}\n\nThe code expires in {ttl_minutes} minutes. \
         If this wasn't you, change your password."
    );
    EmailMessage { subject, html, text }
}

/// Link for accounts created by an administrator
pub fn render_faculty_link(first_name: &str, link: &str, ttl_days: i64) -> EmailMessage {
    let subject = "Set up your scheduling portal account".to_string();
    let html = wrap_html(
        &subject,
        &format!(
            r#"            <p>Hi {name},</p>
            <p>An administrator created an account for you. Choose a password to activate it:</p>
            <p><a href="{link}" class="button">Set password</a></p>
            <p class="note">This link expires in {ttl} days.</p>"#,
            name = html_escape(first_name),
            link = html_escape(link),
            ttl = ttl_days,
        ),
    );
    let text = format!(
        "Hi {first_name},\n\nAn administrator created an account for you. \
         Choose a password to activate it:\n{link}\n\nThis link expires in {ttl_days} days."
    );
    EmailMessage { subject, html, text }
}

/// Outcome of an administrator's review
pub fn render_review_outcome(first_name: &str, approved: bool) -> EmailMessage {
    let (subject, line) = if approved {
        (
            "Your account has been approved",
            "Your account has been approved. You can now log in.",
        )
    } else {
        (
            "Your account request was not approved",
            "An administrator reviewed your registration and did not approve it.",
        )
    };
    let html = wrap_html(
        subject,
        &format!(
            "            <p>Hi {},</p>\n            <p>{}</p>",
            html_escape(first_name),
            line
        ),
    );
    let text = format!("Hi {first_name},\n\n{line}");
    EmailMessage {
        subject: subject.to_string(),
        html,
        text,
    }
}

/// Escape HTML special characters
fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}
