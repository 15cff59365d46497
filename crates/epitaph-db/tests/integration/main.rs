mod checkpoint_tests;
mod common;
mod enrichment_tests;
mod failure_tests;
mod run_tests;
mod subject_tests;
