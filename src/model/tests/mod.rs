mod tests_transactions;
mod tests_writes;
