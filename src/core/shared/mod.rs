pub mod schema;
pub mod state;
pub mod tenancy;
pub mod utils;

pub use schema::*;
pub use utils::DbPool;
