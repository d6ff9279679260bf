pub mod errors;
pub mod evaluation;
pub mod process;

pub use errors::*;
pub use evaluation::*;
pub use process::*;
