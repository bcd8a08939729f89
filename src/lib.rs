//! Lead-generation campaign orchestrator.
//!
//! Campaigns fetch leads from a scraper, enrich them, generate email copy
//! and push them to an email platform through a queue of jobs. Every
//! third-party call passes a per-service circuit breaker and rate limiter;
//! breaker transitions pause and resume the campaigns and jobs that depend
//! on the affected service.
//!
//! # Modules
//!
//! - `api`: HTTP handlers for the operator surface.
//! - `core`: Breaker, limiter, lifecycles, queue management and the worker.
//! - `data`: Persistence traits and their Postgres, Redis and in-memory backends.
//! - `integrations`: Third-party clients and the call guard.
//! - `obs`: Observability and logging.
//! - `bootstrap`: Process wiring shared by the binaries.

pub mod api;
pub mod core;
pub mod data;
pub mod integrations;
pub mod obs;

pub mod bootstrap;
pub mod campaign_event_handler;
pub mod campaign_lifecycle;
pub mod campaign_service;
pub mod circuit_breaker;
pub mod clock;
pub mod config;
pub mod db;
pub mod db_storage;
pub mod enrichment;
pub mod errors;
pub mod handlers;
pub mod job_lifecycle;
pub mod lifecycle;
pub mod models;
pub mod queue_manager;
pub mod rate_limiter;
pub mod redis_backend;
pub mod service_guard;
pub mod services;
pub mod store;
pub mod task_queue;
pub mod worker;
