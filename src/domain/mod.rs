pub mod digest;
pub mod record;
pub mod site;
pub mod units;

pub use digest::*;
pub use record::*;
pub use site::*;
pub use units::*;
