//! Background consumer loops.

pub mod tier_worker;
