//! Behavioural scenarios for the step runner.

mod runner;
