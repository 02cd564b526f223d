//! In-process server and upstream relay for end-to-end tests.

pub mod harness;
#[path = "../../../postbox-mail/tests/support/mock_server.rs"]
pub mod mock_server;

pub use harness::E2ETestHarness;
pub use mock_server::SmtpCommand;
