#[cfg(test)]
mod tests {
    use crate::writeiter::tests::helpers::*;

    /// STATEMENT: REPL     DEL+REPL(pair)     REPL
    /// LSN:        5         6    6            7
    /// READ VIEW:            *
    ///
    /// The pair at LSN 6 did not change the secondary key; the on-disk
    /// secondary index reads identically without it.
    #[test]
    fn test_secondary_pair_is_elided() {
        init_tracing();
        let content = vec![
            replace(5, 1, 1),
            opt(delete(6, 1), 6),
            opt(replace(6, 1, 2), 6),
            replace(7, 1, 3),
        ];
        let output = run(&content, &[6], false, true);
        assert_stmts(&output, &[content[3].clone(), content[0].clone()]);
    }

    /// A pair with no other history elides the key entirely.
    #[test]
    fn test_lone_secondary_pair_elides_the_key() {
        init_tracing();
        let content = vec![opt(delete(6, 1), 6), opt(replace(6, 1, 2), 6)];
        let output = run(&content, &[], false, false);
        assert!(output.is_empty());
    }

    /// The pair as the newest statements of a key: the key itself must
    /// not disappear.
    #[test]
    fn test_pair_as_newest_keeps_the_older_version() {
        init_tracing();
        let content = vec![
            replace(6, 1, 1),
            opt(delete(7, 1), 7),
            opt(replace(7, 1, 2), 7),
        ];
        let output = run(&content, &[], false, false);
        assert_stmts(&output, &[content[0].clone()]);
    }

    /// The primary index ignores the pairing: the REPLACE half is a
    /// normal terminal and dominates everything older.
    #[test]
    fn test_primary_index_ignores_the_pairing() {
        init_tracing();
        let content = vec![
            replace(6, 1, 1),
            opt(delete(7, 1), 7),
            opt(replace(7, 1, 2), 7),
        ];
        let output = run(&content, &[], true, false);
        assert_stmts(&output, &[content[2].clone()]);
    }

    /// A pair split by a read view is visible halves apart; it must not
    /// cancel out.
    #[test]
    fn test_pair_split_across_bands_is_kept() {
        init_tracing();
        let content = vec![
            replace(5, 1, 1),
            opt(delete(6, 1), 99),
            opt(replace(7, 1, 2), 99),
        ];
        let output = run(&content, &[6], false, false);
        assert_stmts(&output, &[content[2].clone(), content[1].clone()]);
    }
}
