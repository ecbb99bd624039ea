pub mod filter;

pub use filter::{CompileError, Filter};
