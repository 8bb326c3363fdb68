pub mod auth;
pub mod combiner;
pub mod compose;
pub mod config;
pub mod db;
pub mod error;
pub mod extract;
pub mod jobs;
pub mod models;
pub mod render;
pub mod routes;
pub mod schema;
pub mod search;
pub mod settings;
pub mod staging;
pub mod state;
pub mod storage;
pub mod workers;

use diesel_migrations::{embed_migrations, EmbeddedMigrations};

pub use workers::{dispatch, JobExecution, Worker, WorkerPool};

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");
