//! Audio utilities: WAV I/O and chunk joining.

mod crossfade;
mod wav;

pub use crossfade::{append_with_crossfade, DEFAULT_CROSSFADE_SAMPLES};
pub use wav::{peak_normalize, read_wav, write_wav};
