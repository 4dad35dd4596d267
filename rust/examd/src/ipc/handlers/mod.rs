pub mod adjust;
pub mod admin;
pub mod backup;
pub mod core;
pub mod exchange;
pub mod scores;
pub mod students;
pub mod subjects;
pub mod versions;
