pub mod extract;
pub mod store;
pub mod table;
pub mod terminal;

pub use extract::*;
pub use store::*;
pub use table::*;
pub use terminal::*;
