use std::iter;

/// Renders an error followed by each of its sources, separated by `": "`.
pub fn error_full_message(err: &dyn std::error::Error) -> String {
    iter::successors(Some(err), |err| err.source())
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(": ")
}

/// Joins the non-empty items with a single space.
pub fn join_non_empty<'a>(items: impl IntoIterator<Item = &'a str>) -> String {
    items
        .into_iter()
        .filter(|item| !item.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use snafu::{ResultExt, Snafu};

    use super::*;

    #[derive(Debug, Snafu)]
    enum Outer {
        #[snafu(display("failed to rotate secret {name}"))]
        Rotate { source: Inner, name: String },
    }

    #[derive(Debug, Snafu)]
    #[snafu(display("CA expired"))]
    struct Inner;

    #[test]
    fn full_message_walks_every_source() {
        let err = Err::<(), _>(Inner)
            .context(RotateSnafu { name: "tls" })
            .unwrap_err();
        assert_eq!(error_full_message(&err), "failed to rotate secret tls: CA expired");
        assert_eq!(error_full_message(&Inner), "CA expired");
    }

    #[test]
    fn join_non_empty_skips_blanks() {
        assert_eq!(join_non_empty(["-Xms1g", "", "-Dproxy"]), "-Xms1g -Dproxy");
        assert_eq!(join_non_empty(Vec::<&str>::new()), "");
    }
}
