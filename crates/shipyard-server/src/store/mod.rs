pub mod db;
pub mod model;
pub mod tokens;

pub use db::Store;
pub use model::{PackageKey, Program, VersionRecord};
pub use tokens::{TokenKind, TokenRecord, ANY_PROGRAM};
