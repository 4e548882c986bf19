pub mod dbkeys;
pub mod espresso;
pub mod l1;
pub mod message;
