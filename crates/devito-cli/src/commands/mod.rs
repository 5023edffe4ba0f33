//! Command implementations.

pub mod check;
pub mod dev;

pub use check::execute as check_execute;
pub use dev::execute as dev_execute;
