mod tests_compaction;
