//! wtty-core: shared pieces of the web terminal gateway.
//!
//! Provides the error type, the webtty wire messages exchanged with the
//! browser client, the `{{ .name }}` template used for window titles and
//! HTML pages, and random token generation for obscured base paths.

pub mod error;
pub mod protocol;
pub mod random;
pub mod template;

// Re-export commonly used items at crate root.
pub use error::{WttyError, WttyResult};
pub use protocol::{ClientMessage, InitMessage, ResizeRequest, ServerMessage, PROTOCOLS};
pub use random::random_string;
pub use template::Template;
