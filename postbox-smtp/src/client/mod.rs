//! SMTP client used to relay outbound mail and to drive the listener in
//! tests.
//!
//! ```no_run
//! use postbox_smtp::client::SmtpClient;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut client = SmtpClient::connect("smtp.example.com:587", "smtp.example.com".into()).await?;
//! client.read_greeting().await?;
//! client.ehlo("mail.example.com").await?;
//! if client.supports("STARTTLS") {
//!     client.starttls().await?;
//!     client.ehlo("mail.example.com").await?;
//! }
//! client.authenticate("user", "secret").await?;
//! client.mail_from("a@example.com", None).await?.into_result()?;
//! client.rcpt_to("b@example.org").await?.into_result()?;
//! client.data().await?;
//! client.send_data(b"Subject: Hi\r\n\r\nHello").await?.into_result()?;
//! client.quit().await?;
//! # Ok(())
//! # }
//! ```

mod error;
mod response;
mod smtp_client;

pub use error::{ClientError, Result};
pub use response::{Response, ResponseLine};
pub use smtp_client::{SmtpClient, dot_stuff};
