pub mod job;
pub mod stream;

pub use job::*;
pub use stream::*;
