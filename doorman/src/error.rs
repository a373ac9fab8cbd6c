use thiserror::Error;

#[derive(Error, Debug)]
pub enum DoormanError {
    #[error("port secret missing")]
    NoSecret,
    #[error("port count {0} out of range 1..=255")]
    PortCount(usize),
    #[error("queue capacity must be non-zero")]
    QueueCapacity,
    #[error("no trusted clients configured")]
    NoClients,
    #[error("client {id}: {reason}")]
    ClientKey { id: String, reason: String },
    #[error("gate command list empty")]
    EmptyCommand,
}
