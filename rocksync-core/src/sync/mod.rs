pub mod engine;
pub mod hash;
pub mod index;
pub mod paths;
pub mod planner;
pub mod prune;
pub mod scanner;
pub mod session;
pub mod transfer;
pub mod transform;
pub mod verify;
