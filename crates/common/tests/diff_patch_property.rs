use proptest::collection::vec;
use proptest::prelude::*;
use vellum_common::diff::{apply_patch, create_patch};

fn interesting_char() -> impl Strategy<Value = char> {
    prop_oneof![
        (b'a'..=b'z').prop_map(char::from),
        (b'A'..=b'Z').prop_map(char::from),
        (b'0'..=b'9').prop_map(char::from),
        Just(' '),
        Just('\n'),
        Just('\t'),
        Just('-'),
        Just('_'),
        Just('#'),
        Just('*'),
        Just('.'),
        Just(','),
        Just(':'),
        Just('%'),
        Just('@'),
        Just('🙂'),
        Just('🚀'),
        Just('中'),
        Just('文'),
        Just('界'),
        Just('あ'),
        Just('い'),
    ]
}

fn markdown_string(max_len: usize) -> impl Strategy<Value = String> {
    vec(interesting_char(), 0..max_len).prop_map(|chars| chars.into_iter().collect())
}

fn assert_patch_roundtrip(old_text: &str, new_text: &str) {
    let patch = create_patch(old_text, new_text);
    let (patched, results) =
        apply_patch(old_text, &patch).expect("generated patch text should parse");

    assert_eq!(
        patched,
        new_text,
        "patch roundtrip mismatch: old_len={} new_len={} patch={patch:?}",
        old_text.len(),
        new_text.len()
    );
    assert!(results.iter().all(|&ok| ok), "all hunks should apply on an unchanged base");
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(512))]

    #[test]
    fn patch_roundtrips_between_arbitrary_texts(
        old_text in markdown_string(80),
        new_text in markdown_string(80),
    ) {
        assert_patch_roundtrip(&old_text, &new_text);
    }

    #[test]
    fn patch_of_identical_texts_is_empty(text in markdown_string(80)) {
        prop_assert_eq!(create_patch(&text, &text), "");
    }

    #[test]
    fn patch_text_survives_reserialization(
        old_text in markdown_string(60),
        new_text in markdown_string(60),
    ) {
        let patch = create_patch(&old_text, &new_text);
        let hunks = vellum_common::diff::hunks_from_text(&patch).unwrap();
        let reserialized = vellum_common::diff::hunks_to_text(&hunks);
        prop_assert_eq!(patch, reserialized);
    }
}
