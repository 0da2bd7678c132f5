mod helpers;

mod tests_delete;
mod tests_optimized;
