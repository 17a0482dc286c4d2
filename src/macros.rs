pub use serde_json;

/// Builds a [`RawRow`](crate::frame::RawRow) from `key => value` pairs.
/// Values are anything `serde_json::json!` accepts.
///
/// ```
/// let row = ripple::row! { "Name" => "x", "amount" => 2 };
/// assert_eq!(row.len(), 2);
/// ```
#[macro_export]
macro_rules! row {
    ($($key:expr => $value:tt),* $(,)?) => {{
        let mut row = $crate::frame::RawRow::new();
        $( row.insert(::std::string::String::from($key), $crate::macros::serde_json::json!($value)); )*
        row
    }};
}

/// Builds a `Vec` of raw rows, one `{ ... }` group per row.
#[macro_export]
macro_rules! rows {
    ($({ $($body:tt)* }),* $(,)?) => {
        vec![$($crate::row! { $($body)* }),*]
    };
}
