//! Placeholder rewriting and argument encoding
//!
//! Statements use `?` placeholders. They are rewritten into `$1`, `$2`, ...
//! and the first arguments are spliced into the text in wire form; any
//! arguments past the placeholder count travel separately in the `args` form
//! field as a JSON array.

use crate::error::{Error, Result};
use crate::types::Arg;

/// A statement ready to send
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedStatement {
    pub statement: String,
    /// Arguments beyond the placeholder count, in call order
    pub args: Vec<Arg>,
}

/// Replace each `?` with a sequential `$n` marker.
///
/// Returns the rewritten text and the number of markers written.
pub fn rewrite_placeholders(statement: &str) -> (String, usize) {
    let mut count = 0;
    let mut out = String::with_capacity(statement.len() + 8);
    for c in statement.chars() {
        if c == '?' {
            count += 1;
            out.push('$');
            out.push_str(&count.to_string());
        } else {
            out.push(c);
        }
    }
    (out, count)
}

/// Splice the first `count` arguments into their `$n` markers.
///
/// Returns the new text and the arguments that had no marker.
pub fn substitute_positional(statement: &str, count: usize, args: &[Arg]) -> (String, Vec<Arg>) {
    let bound = count.min(args.len());
    let mut out = String::with_capacity(statement.len());
    let mut chars = statement.char_indices().peekable();

    while let Some((i, c)) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }

        let digits_start = i + 1;
        let mut digits_end = digits_start;
        while let Some(&(j, d)) = chars.peek() {
            if !d.is_ascii_digit() {
                break;
            }
            digits_end = j + d.len_utf8();
            chars.next();
        }

        let marker = &statement[digits_start..digits_end];
        match marker.parse::<usize>() {
            Ok(n) if n >= 1 && n <= bound => out.push_str(&args[n - 1].to_wire()),
            _ => {
                out.push('$');
                out.push_str(marker);
            }
        }
    }

    (out, args.iter().skip(count).cloned().collect())
}

/// Encode a statement and its call arguments.
///
/// A statement without placeholders is sent untouched. Supplying fewer
/// arguments than placeholders is an error.
pub fn encode(statement: &str, args: &[Arg]) -> Result<EncodedStatement> {
    let (rewritten, count) = rewrite_placeholders(statement);
    if count == 0 {
        return Ok(EncodedStatement {
            statement: statement.to_string(),
            args: args.to_vec(),
        });
    }
    if args.len() < count {
        return Err(Error::ArgumentCountMismatch {
            expected: count,
            actual: args.len(),
        });
    }

    let (statement, args) = substitute_positional(&rewritten, count, args);
    Ok(EncodedStatement { statement, args })
}

/// The `args` form value: `[a,b,...]`, or `None` when there is nothing to send.
pub fn positional_arg_list(args: &[Arg]) -> Option<String> {
    if args.is_empty() {
        return None;
    }
    let encoded: Vec<String> = args.iter().map(Arg::to_wire).collect();
    Some(format!("[{}]", encoded.join(",")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rewrite_counts_markers() {
        let (text, count) =
            rewrite_placeholders("insert into default(key, value) values(?, {'a':?, 'b':?})");
        assert_eq!(text, "insert into default(key, value) values($1, {'a':$2, 'b':$3})");
        assert_eq!(count, 3);
    }

    #[test]
    fn test_rewrite_without_placeholders() {
        let (text, count) = rewrite_placeholders("SELECT RAW 1;");
        assert_eq!(text, "SELECT RAW 1;");
        assert_eq!(count, 0);
    }

    #[test]
    fn test_fewer_args_than_markers() {
        let err = encode("select * from b where a = ? and c = ?", &[Arg::from(1)]).unwrap_err();
        assert!(matches!(
            err,
            Error::ArgumentCountMismatch { expected: 2, actual: 1 }
        ));
    }

    #[test]
    fn test_args_spliced_in_wire_form() {
        let encoded = encode(
            "select * from `beer-sample` where city = ? and abv > ?",
            &[Arg::from("San Francisco"), Arg::from(5.5)],
        )
        .unwrap();
        assert_eq!(
            encoded.statement,
            "select * from `beer-sample` where city = \"San Francisco\" and abv > 5.5"
        );
        assert!(encoded.args.is_empty());
    }

    #[test]
    fn test_extra_args_forwarded_in_order() {
        let encoded = encode(
            "select ? , $2, $3",
            &[Arg::from("a"), Arg::from(2), Arg::from(true), Arg::from("d")],
        )
        .unwrap();
        assert_eq!(encoded.statement, "select \"a\" , $2, $3");
        assert_eq!(
            encoded.args,
            vec![Arg::from(2), Arg::from(true), Arg::from("d")]
        );
        assert_eq!(
            positional_arg_list(&encoded.args).as_deref(),
            Some("[2,true,\"d\"]")
        );
    }

    #[test]
    fn test_double_digit_markers() {
        let args: Vec<Arg> = (1..=11).map(|i| Arg::from(i * 100)).collect();
        let statement = vec!["?"; 11].join(",");
        let encoded = encode(&statement, &args).unwrap();
        assert_eq!(
            encoded.statement,
            "100,200,300,400,500,600,700,800,900,1000,1100"
        );
    }

    #[test]
    fn test_markers_without_args() {
        let err = encode("select * from b where a = ? and c = ?", &[]).unwrap_err();
        assert!(matches!(
            err,
            Error::ArgumentCountMismatch { expected: 2, actual: 0 }
        ));
    }

    #[test]
    fn test_no_markers_leaves_text_alone() {
        let encoded = encode("select $1 from x", &[]).unwrap();
        assert_eq!(encoded.statement, "select $1 from x");
        assert!(encoded.args.is_empty());

        let encoded = encode("select $1 from x", &[Arg::from(7)]).unwrap();
        assert_eq!(encoded.statement, "select $1 from x");
        assert_eq!(encoded.args, vec![Arg::from(7)]);
    }

    #[test]
    fn test_empty_arg_list() {
        assert_eq!(positional_arg_list(&[]), None);
    }
}
