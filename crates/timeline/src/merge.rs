//! Delta merging for streamed thinking/assistant text.
//!
//! Gateways are inconsistent about what `delta` carries. Most send true
//! increments, some resend the whole text so far, and reconnect replays can
//! deliver either form late. Concatenating a cumulative delta onto the text it
//! already contains produces "HelloHello there", so every delta is classified
//! before it touches the text.

/// What to do with an incoming delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaMerge {
    /// Append the delta to the current text.
    Append,
    /// The delta is a full restatement; it becomes the text.
    Replace,
    /// Nothing new: empty, or stale on a cumulative stream.
    Ignore,
}

/// Classify `delta` against the accumulated `current` text.
///
/// `cumulative` records whether this stream has already shown snapshot
/// behavior (an explicit full text, or a delta that extended the text it
/// restated). Only then are equal or shorter restatements treated as stale;
/// before that they are ordinary increments.
pub fn classify_delta(current: &str, delta: &str, cumulative: bool) -> DeltaMerge {
    if delta.is_empty() {
        return DeltaMerge::Ignore;
    }
    if current.is_empty() {
        return DeltaMerge::Append;
    }
    // A repeated token ("ha", "\n") is an increment until the stream is
    // known to resend its whole text.
    if delta == current {
        return if cumulative {
            DeltaMerge::Ignore
        } else {
            DeltaMerge::Append
        };
    }
    if delta.starts_with(current) {
        return DeltaMerge::Replace;
    }
    if current.starts_with(delta) {
        return if cumulative {
            DeltaMerge::Ignore
        } else {
            DeltaMerge::Append
        };
    }
    // Neither extends the other. A cumulative stream whose new snapshot
    // diverges after a shared prefix keeps the longer text.
    if cumulative && delta.len() > current.len() && common_prefix_len(current, delta) > 0 {
        return DeltaMerge::Replace;
    }
    DeltaMerge::Append
}

fn common_prefix_len(a: &str, b: &str) -> usize {
    a.chars()
        .zip(b.chars())
        .take_while(|(x, y)| x == y)
        .map(|(x, _)| x.len_utf8())
        .sum()
}

/// Merge bookkeeping for one stream. The text itself lives with its owner,
/// so merging never copies it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeState {
    cumulative: bool,
}

impl MergeState {
    pub fn is_cumulative(&self) -> bool {
        self.cumulative
    }

    /// Replace `text` with an authoritative snapshot. Returns whether it
    /// changed.
    pub fn set_snapshot(&mut self, text: &mut String, snapshot: &str) -> bool {
        self.cumulative = true;
        if text == snapshot {
            return false;
        }
        text.clear();
        text.push_str(snapshot);
        true
    }

    /// Merge a delta into `text`. Returns whether it changed.
    pub fn apply_delta(&mut self, text: &mut String, delta: &str) -> bool {
        match classify_delta(text, delta, self.cumulative) {
            DeltaMerge::Append => {
                text.push_str(delta);
                true
            },
            DeltaMerge::Replace => {
                self.cumulative = true;
                text.clear();
                text.push_str(delta);
                true
            },
            DeltaMerge::Ignore => false,
        }
    }
}

/// Accumulated text of one stream together with its merge state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamText {
    text: String,
    state: MergeState,
}

impl StreamText {
    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn is_cumulative(&self) -> bool {
        self.state.is_cumulative()
    }

    pub fn set_snapshot(&mut self, text: &str) -> bool {
        self.state.set_snapshot(&mut self.text, text)
    }

    pub fn apply_delta(&mut self, delta: &str) -> bool {
        self.state.apply_delta(&mut self.text, delta)
    }
}

#[cfg(test)]
mod tests {
    use {super::*, rstest::rstest};

    fn fold(deltas: &[&str]) -> String {
        let mut text = StreamText::default();
        for delta in deltas {
            text.apply_delta(delta);
        }
        text.as_str().to_string()
    }

    #[rstest]
    #[case("", "Hi", false, DeltaMerge::Append)]
    #[case("Hello", "", false, DeltaMerge::Ignore)]
    #[case("Hello", "Hello", false, DeltaMerge::Append)]
    #[case("Hello", "Hello", true, DeltaMerge::Ignore)]
    #[case("Hello", "Hello there", false, DeltaMerge::Replace)]
    #[case("Hello", " there", false, DeltaMerge::Append)]
    #[case("Hello there", "Hello", true, DeltaMerge::Ignore)]
    #[case("Hello there", "Hello", false, DeltaMerge::Append)]
    #[case("Hello world", "Hello there, friend", true, DeltaMerge::Replace)]
    #[case("Hello world", "Hello there, friend", false, DeltaMerge::Append)]
    #[case("Hello world", "!", true, DeltaMerge::Append)]
    #[case("Hello world", "xyz and more text", true, DeltaMerge::Append)]
    fn classification(
        #[case] current: &str,
        #[case] delta: &str,
        #[case] cumulative: bool,
        #[case] expected: DeltaMerge,
    ) {
        assert_eq!(classify_delta(current, delta, cumulative), expected);
    }

    #[test]
    fn cumulative_resnapshot_has_no_duplicated_prefix() {
        assert_eq!(fold(&["Hello", "Hello there"]), "Hello there");
        assert_eq!(
            fold(&["He", "Hell", "Hello", "Hello wor", "Hello world"]),
            "Hello world"
        );
    }

    #[test]
    fn incremental_deltas_concatenate_in_order() {
        let deltas = ["The", " quick", " brown", " fox", " jumps", ".", " It", " lands."];
        assert_eq!(fold(&deltas), deltas.concat());
    }

    #[test]
    fn repeated_tokens_stay_incremental() {
        // Short tokens that happen to be prefixes of the text are increments
        // until the stream proves it is cumulative.
        let deltas = ["ab", "a", "b", "ab"];
        assert_eq!(fold(&deltas), "ababab");
    }

    #[test]
    fn stale_restatement_after_snapshot_is_ignored() {
        assert_eq!(fold(&["Hi", "Hi there", "Hi", "Hi there"]), "Hi there");
    }

    #[rstest]
    #[case(&["ha", "ha", "ha"], "hahaha")]
    #[case(&["\n", "\n", "Title"], "\n\nTitle")]
    #[case(&["ok", "ok"], "okok")]
    fn repeated_identical_tokens_are_kept(#[case] deltas: &[&str], #[case] expected: &str) {
        assert_eq!(fold(deltas), expected);
    }

    #[test]
    fn equal_delta_on_cumulative_stream_is_ignored() {
        let mut text = StreamText::default();
        text.apply_delta("Hello");
        assert!(text.apply_delta("Hello there"));
        assert!(text.is_cumulative());
        assert!(!text.apply_delta("Hello there"));
        assert!(!text.apply_delta("Hello"));
        assert_eq!(text.as_str(), "Hello there");
    }

    #[test]
    fn merge_state_edits_borrowed_text() {
        let mut state = MergeState::default();
        let mut text = String::new();
        assert!(state.apply_delta(&mut text, "Hi"));
        assert!(state.apply_delta(&mut text, "Hi"));
        assert_eq!(text, "HiHi");
        assert!(state.set_snapshot(&mut text, "Hi there"));
        assert!(!state.apply_delta(&mut text, "Hi there"));
        assert_eq!(text, "Hi there");
    }

    #[test]
    fn snapshot_replaces_outright() {
        let mut text = StreamText::default();
        text.apply_delta("draft");
        assert!(text.set_snapshot("final answer"));
        assert_eq!(text.as_str(), "final answer");
        assert!(!text.set_snapshot("final answer"));
        assert!(text.apply_delta("final answer, expanded"));
        assert_eq!(text.as_str(), "final answer, expanded");
    }

    #[test]
    fn multibyte_common_prefix() {
        assert_eq!(common_prefix_len("héllo", "hélp"), "hél".len());
        assert_eq!(
            classify_delta("héllo wörld", "héllo there wörld", true),
            DeltaMerge::Replace
        );
    }
}
