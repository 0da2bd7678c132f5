#[cfg(test)]
mod tests {
    use crate::writeiter::tests::helpers::*;

    /// STATEMENT: REPL DEL REPL DEL REPL DEL
    /// LSN:        4    5   6    7   8    9
    /// READ VIEW:       *        *        *
    ///
    /// Every read view observes "deleted"; the oldest DELETE serves all
    /// of them and the tautological newer ones are dropped.
    #[test]
    fn test_tautological_deletes_collapse_onto_the_oldest() {
        init_tracing();
        let content = vec![
            replace(4, 1, 1),
            delete(5, 1),
            replace(6, 1, 2),
            delete(7, 1),
            replace(8, 1, 3),
            delete(9, 1),
        ];
        let output = run(&content, &[5, 7, 9], true, false);
        assert_stmts(&output, &[content[1].clone()]);
    }

    /// A lone DELETE at the bottom of the tree shadows nothing: with no
    /// read view pinning it, the key vanishes entirely.
    #[test]
    fn test_last_level_elides_a_dangling_delete() {
        init_tracing();
        let content = vec![replace(5, 1, 1), delete(6, 1)];
        let output = run(&content, &[], true, true);
        assert!(output.is_empty());
    }

    /// A read view pinned exactly at the DELETE's LSN still observes it:
    /// the DELETE must survive even at the last level.
    #[test]
    fn test_delete_observed_by_a_read_view_is_never_elided() {
        init_tracing();
        let content = vec![delete(7, 1), replace(8, 1, 1)];
        let output = run(&content, &[7, 8], true, true);
        assert_stmts(&output, &[content[1].clone(), content[0].clone()]);
    }

    /// Off the last level a DELETE always survives: an older run may hold
    /// data it still shadows.
    #[test]
    fn test_delete_is_kept_above_the_last_level() {
        init_tracing();
        let content = vec![delete(7, 1), replace(8, 1, 1)];
        let output = run(&content, &[], true, false);
        assert_stmts(&output, &[content[1].clone(), content[0].clone()]);
    }

    /// The DELETE and the REPLACE that buries it share a band: the view
    /// at 8 sees only the replace, the view at 5 the old version, and no
    /// DELETE reaches the output at all.
    #[test]
    fn test_delete_buried_inside_a_band_is_dominated() {
        init_tracing();
        let content = vec![replace(5, 1, 1), delete(7, 1), replace(8, 1, 2)];
        let output = run(&content, &[5, 8], true, true);
        assert_stmts(&output, &[content[2].clone(), content[0].clone()]);
    }

    /// A DELETE newer than every live read view is observed by no one:
    /// at the last level the key vanishes.
    #[test]
    fn test_delete_above_every_read_view_is_elided() {
        init_tracing();
        let content = vec![delete(6, 1)];
        let output = run(&content, &[3], true, true);
        assert!(output.is_empty());
    }

    /// Deleted and re-inserted under one band: the DELETE is dominated
    /// and only the newest version is emitted.
    #[test]
    fn test_delete_dominated_within_a_band() {
        init_tracing();
        let content = vec![replace(5, 1, 1), delete(6, 1), replace(7, 1, 2)];
        let output = run(&content, &[], true, false);
        assert_stmts(&output, &[content[2].clone()]);
    }
}
