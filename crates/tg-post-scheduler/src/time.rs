//! Users think in Moscow time, the database stores UTC. The conversions
//! between the two happen only at the edges of the bot in this module.

use chrono::prelude::*;
use chrono_tz::Tz;

pub(crate) const MOSCOW: Tz = chrono_tz::Europe::Moscow;

/// The formats accepted from the users, tried in order
const INPUT_FORMATS: &[&str] = &["%Y-%m-%d %H:%M", "%d.%m.%Y %H:%M"];

#[derive(Debug, thiserror::Error)]
pub(crate) enum ScheduleTimeError {
    #[error(
        "Неверный формат времени: `{input}`. \
        Используйте `ГГГГ-ММ-ДД ЧЧ:ММ` или `ДД.ММ.ГГГГ ЧЧ:ММ` (МСК)"
    )]
    InvalidFormat { input: String },

    #[error("Время должно быть в будущем, а {time} (МСК) уже наступило")]
    NotInFuture { time: String },
}

/// Parse the time of publication entered by the user in Moscow time.
/// The returned moment is guaranteed to be strictly after `now`.
pub(crate) fn parse_local_datetime(
    input: &str,
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>, ScheduleTimeError> {
    let input = input.trim();

    let invalid_format = || ScheduleTimeError::InvalidFormat {
        input: input.to_owned(),
    };

    let naive = INPUT_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(input, format).ok())
        .ok_or_else(invalid_format)?;

    let local = MOSCOW
        .from_local_datetime(&naive)
        .single()
        .ok_or_else(invalid_format)?;

    let utc = local.with_timezone(&Utc);

    if utc <= now {
        return Err(ScheduleTimeError::NotInFuture {
            time: format_local(utc),
        });
    }

    Ok(utc)
}

/// `DD.MM.YYYY HH:MM` in Moscow time
pub(crate) fn format_local(moment: DateTime<Utc>) -> String {
    moment.with_timezone(&MOSCOW).format("%d.%m.%Y %H:%M").to_string()
}

/// `DD.MM.YYYY HH:MM:SS` in Moscow time
pub(crate) fn format_local_seconds(moment: DateTime<Utc>) -> String {
    moment
        .with_timezone(&MOSCOW)
        .format("%d.%m.%Y %H:%M:%S")
        .to_string()
}

/// `DD.MM.YYYY` in Moscow time
pub(crate) fn format_local_date(moment: DateTime<Utc>) -> String {
    moment.with_timezone(&MOSCOW).format("%d.%m.%Y").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use expect_test::{expect, Expect};

    fn now() -> DateTime<Utc> {
        // 15:00 in Moscow
        Utc.with_ymd_and_hms(2024, 12, 25, 12, 0, 0).unwrap()
    }

    #[track_caller]
    fn assert_parse(input: &str, expected: Expect) {
        let actual = match parse_local_datetime(input, now()) {
            Ok(utc) => format!("{} UTC", utc.format("%Y-%m-%d %H:%M:%S")),
            Err(err) => format!("{err:?}"),
        };
        expected.assert_eq(&actual);
    }

    #[test]
    fn accepted_formats() {
        assert_parse("2024-12-25 15:30", expect!["2024-12-25 12:30:00 UTC"]);
        assert_parse("25.12.2024 15:30", expect!["2024-12-25 12:30:00 UTC"]);
        assert_parse("  2025-01-01 00:00\n", expect!["2024-12-31 21:00:00 UTC"]);
    }

    #[test]
    fn rejects_garbage() {
        assert_parse(
            "tomorrow",
            expect![[r#"InvalidFormat { input: "tomorrow" }"#]],
        );
        assert_parse(
            "2024-13-01 10:00",
            expect![[r#"InvalidFormat { input: "2024-13-01 10:00" }"#]],
        );
        assert_parse(
            "25/12/2024 15:30",
            expect![[r#"InvalidFormat { input: "25/12/2024 15:30" }"#]],
        );
    }

    #[test]
    fn rejects_past_and_present() {
        assert_parse(
            "2024-12-25 15:00",
            expect![[r#"NotInFuture { time: "25.12.2024 15:00" }"#]],
        );
        assert_parse(
            "24.12.2024 23:59",
            expect![[r#"NotInFuture { time: "24.12.2024 23:59" }"#]],
        );
    }

    #[test]
    fn formatting() {
        let moment = Utc.with_ymd_and_hms(2024, 12, 25, 21, 5, 9).unwrap();
        expect!["26.12.2024 00:05"].assert_eq(&format_local(moment));
        expect!["26.12.2024 00:05:09"].assert_eq(&format_local_seconds(moment));
        expect!["26.12.2024"].assert_eq(&format_local_date(moment));
    }
}
