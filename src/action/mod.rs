// Action playback module
//
// Provides:
// - Motion scripts (looping keyframe timelines) with validation
// - Action library, hot-swapped as a whole on reload
// - Playback cursor computing the active keyframe from the clock

pub mod library;
pub mod playback;
pub mod script;

pub use library::{ActionFile, ActionLibrary, LibraryError};
pub use playback::PlaybackCursor;
pub use script::{Keyframe, MotionScript, ScriptError};
