#![cfg_attr(target_os = "none", no_std)]

pub mod logger;
pub mod mem;
pub mod sizes;
