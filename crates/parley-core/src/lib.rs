pub mod catalog;
pub mod error;
pub mod fakes;
pub mod traits;
pub mod types;

pub use catalog::*;
pub use error::*;
pub use traits::*;
pub use types::*;
