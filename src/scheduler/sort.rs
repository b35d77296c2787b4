// SPDX-FileCopyrightText: Copyright (c) 2024-2025 gpupool contributors
// SPDX-License-Identifier: Apache-2.0

//! Multi-key stable sort utility.
//!
//! Keys apply left to right; the first non-zero comparison wins and ties
//! fall through to the original order. A plain key orders larger values
//! first. A key prefixed with `-` inverts the comparison result, which for
//! numeric keys yields ascending order. Keys absent on either side are
//! skipped entirely.

use std::cmp::Ordering;

/// Named numeric properties for key-based sorting. `None` means the item
/// does not carry that key and the comparator must skip it.
pub trait SortProps {
    fn prop(&self, name: &str) -> Option<f64>;
}

pub enum SortKey<'a, T> {
    /// Property name, optionally prefixed with the `-` reversal marker.
    Prop(&'a str),
    /// Custom two-argument comparator.
    Cmp(&'a dyn Fn(&T, &T) -> Ordering),
}

fn compare_prop<T: SortProps>(a: &T, b: &T, raw: &str) -> Ordering {
    let (reversed, name) = match raw.strip_prefix('-') {
        Some(name) => (true, name),
        None => (false, raw),
    };

    let (Some(va), Some(vb)) = (a.prop(name), b.prop(name)) else {
        return Ordering::Equal;
    };

    // Plain key: larger first. Reversal marker: invert, i.e. smaller first.
    let ord = vb.partial_cmp(&va).unwrap_or(Ordering::Equal);
    if reversed { ord.reverse() } else { ord }
}

/// Stable sort by an ordered list of keys.
pub fn sort_by_keys<T: SortProps>(items: &mut [T], keys: &[SortKey<'_, T>]) {
    items.sort_by(|a, b| {
        for key in keys {
            let ord = match key {
                SortKey::Prop(raw) => compare_prop(a, b, raw),
                SortKey::Cmp(cmp) => cmp(a, b),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Item {
        name: &'static str,
        tflops: f64,
        queue: f64,
    }

    impl SortProps for Item {
        fn prop(&self, name: &str) -> Option<f64> {
            match name {
                "maxTflops" => Some(self.tflops),
                "queueSize" => Some(self.queue),
                _ => None,
            }
        }
    }

    fn items() -> Vec<Item> {
        vec![
            Item { name: "a", tflops: 10.0, queue: 3.0 },
            Item { name: "b", tflops: 40.0, queue: 1.0 },
            Item { name: "c", tflops: 25.0, queue: 2.0 },
        ]
    }

    #[test]
    fn test_plain_key_orders_largest_first() {
        let mut v = items();
        sort_by_keys(&mut v, &[SortKey::Prop("maxTflops")]);
        let names: Vec<_> = v.iter().map(|i| i.name).collect();
        assert_eq!(names, ["b", "c", "a"]);
    }

    #[test]
    fn test_reversal_marker_yields_ascending() {
        let mut v = items();
        sort_by_keys(&mut v, &[SortKey::Prop("-queueSize")]);
        let names: Vec<_> = v.iter().map(|i| i.name).collect();
        assert_eq!(names, ["b", "c", "a"]);
    }

    #[test]
    fn test_missing_key_is_skipped_and_order_is_stable() {
        let mut v = items();
        sort_by_keys(&mut v, &[SortKey::Prop("timeStarted")]);
        let names: Vec<_> = v.iter().map(|i| i.name).collect();
        assert_eq!(names, ["a", "b", "c"]);
    }

    #[test]
    fn test_custom_comparator_breaks_ties_first_nonzero_wins() {
        let mut v = vec![
            Item { name: "x", tflops: 10.0, queue: 0.0 },
            Item { name: "y", tflops: 10.0, queue: 0.0 },
        ];
        let prefer_y = |a: &Item, b: &Item| match (a.name, b.name) {
            ("y", "x") => Ordering::Less,
            ("x", "y") => Ordering::Greater,
            _ => Ordering::Equal,
        };
        sort_by_keys(&mut v, &[SortKey::Prop("maxTflops"), SortKey::Cmp(&prefer_y)]);
        assert_eq!(v[0].name, "y");
    }
}
