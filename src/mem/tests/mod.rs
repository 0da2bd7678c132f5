mod helpers;

mod tests_upsert_squash;
