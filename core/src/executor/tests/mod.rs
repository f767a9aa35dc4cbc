mod await_tests;
mod helpers;
mod rollback_tests;
