//! Audio devices, the PCM wire codec and the input volume meter.

pub mod backend;
#[cfg(feature = "cpal-audio")]
pub mod capture;
pub mod codec;
pub mod device;
pub mod meter;
#[cfg(feature = "cpal-audio")]
pub mod output;
pub mod wav;

pub use backend::{CpalBackend, WavBackend};
pub use device::{AudioBackend, Microphone, OutputDevice};
