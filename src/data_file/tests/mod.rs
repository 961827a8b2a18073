pub mod helpers;
mod tests_poison;
mod tests_random_ops;
