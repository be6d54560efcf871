use std::time::Duration;

/// Renders a duration like `2 days 3 hours 15 minutes`.
pub(crate) fn human_duration(duration: Duration) -> String {
    timeago::Formatter::new()
        .num_items(3)
        .ago("")
        .convert(duration)
        .trim()
        .to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use expect_test::expect;

    #[test]
    fn smoke() {
        let duration = Duration::from_secs(2 * 24 * 3600 + 3 * 3600 + 15 * 60 + 7);
        expect!["2 days 3 hours 15 minutes"].assert_eq(&human_duration(duration));
    }
}
