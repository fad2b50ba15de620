mod tests_transitions;
