// Intentionally empty: this crate exists only for the tests/ directory.
