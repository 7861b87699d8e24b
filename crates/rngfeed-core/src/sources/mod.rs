//! Entropy source drivers.

pub mod os;
pub mod stream;

use crate::config::Config;
use crate::error::DaemonError;
use crate::source::{DriverKind, EntropySource};

pub use os::OsSource;
pub use stream::StreamSource;

/// Open the source driver selected by the configuration.
pub fn open_source(config: &Config) -> Result<Box<dyn EntropySource>, DaemonError> {
    match config.driver {
        DriverKind::Stream => {
            let source =
                StreamSource::open(&config.rng_device).map_err(|cause| DaemonError::SourceOpen {
                    path: config.rng_device.clone(),
                    cause,
                })?;
            Ok(Box::new(source))
        }
        DriverKind::Os => Ok(Box::new(OsSource::new())),
    }
}
