
pub mod clocksync;
pub mod constants;
pub mod receiver;
pub mod tracker;
