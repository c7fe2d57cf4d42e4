pub mod buckets;
pub mod files;
pub mod groups;
pub mod health;
pub mod reports;
pub mod tasks;
