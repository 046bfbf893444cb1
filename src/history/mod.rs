pub mod client;
pub mod seeder;

pub use client::{parse_history_payload, HistorySource, RestHistorySource};
pub use seeder::{HistoricalSeeder, Seeded};
