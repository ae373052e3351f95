mod tests_registry;
