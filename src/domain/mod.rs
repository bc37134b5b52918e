pub mod battery;
pub mod decision;
pub mod forecast;
pub mod session;
pub mod types;

pub use battery::*;
pub use decision::*;
pub use forecast::*;
pub use session::*;
pub use types::*;
