//! The outbound mail seam.
//!
//! Reminder-style operations send one message per line. Opening a transport
//! connection per line would dominate the cost of a large batch, so a worker
//! opens one [`MailConnection`] before its line loop and closes it once
//! after, on the error path too. Template rendering is an external concern;
//! the connection carries already rendered subjects and bodies.
use async_trait::async_trait;

use crate::worker::WorkerError;

#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn open(&self) -> Result<Box<dyn MailConnection>, WorkerError>;
}

#[async_trait]
pub trait MailConnection: Send {
    async fn send(&mut self, to: &str, subject: &str, body: &str) -> Result<(), WorkerError>;
    async fn close(self: Box<Self>) -> Result<(), WorkerError>;
}
