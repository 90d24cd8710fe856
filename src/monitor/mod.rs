//! Removable-device detection: interchangeable observation strategies and
//! the monitor that reconciles them into insert/remove callbacks.

pub mod device_monitor;
pub mod observer;
