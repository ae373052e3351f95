mod tests_thresholds;
