pub mod helpers;
mod tests_concurrency;
mod tests_crud;
