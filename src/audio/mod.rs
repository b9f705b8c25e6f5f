//! Audio capture, decoding and playback via cpal and symphonia.

pub mod capture;
pub mod convert;
pub mod decode;
pub mod playback;
