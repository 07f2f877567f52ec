#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NetworkError {
    #[error("association failed: {0}")]
    Association(String),
}

/// The device's network link (Wi-Fi station on the ESP32).
///
/// To be implemented for each platform.
pub trait Network {
    /// Makes one attempt to bring the link up. Retrying is up to the caller.
    fn associate(&mut self) -> Result<(), NetworkError>;

    /// Whether the link is currently up.
    fn is_up(&self) -> bool;
}

impl<N: Network + ?Sized> Network for Box<N> {
    fn associate(&mut self) -> Result<(), NetworkError> {
        (**self).associate()
    }

    fn is_up(&self) -> bool {
        (**self).is_up()
    }
}

/// A link managed by someone else, e.g. the host operating system.
#[derive(Debug, Default)]
pub struct HostNetwork;

impl Network for HostNetwork {
    fn associate(&mut self) -> Result<(), NetworkError> {
        Ok(())
    }

    fn is_up(&self) -> bool {
        true
    }
}
