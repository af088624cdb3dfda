pub mod pump;
pub mod selector;
pub mod timer;
