mod helpers;

mod tests_routing;

// Writers racing flushes and destroys
mod tests_concurrency;
