//! Integration test modules for plinth

mod lifecycle;
mod processing;
mod programs;
