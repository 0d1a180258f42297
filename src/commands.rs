pub mod check;
pub mod pipe;

pub use check::run_chain_check;
pub use pipe::{run_pipe, Direction};
