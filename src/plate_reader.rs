use crate::config::ReaderConfig;
use crate::model::Detection;

#[derive(Debug, Clone, Copy, PartialEq)]
struct CharCenter {
    x: f32,
    y: f32,
    class: usize,
}

/// Straight line through two points, as slope and intercept.
fn linear_equation((x1, y1): (f32, f32), (x2, y2): (f32, f32)) -> (f32, f32) {
    let a = (y2 - y1) / (x2 - x1);
    let b = y1 - a * x1;
    (a, b)
}

fn on_line(point: (f32, f32), left: (f32, f32), right: (f32, f32), tolerance: f32) -> bool {
    let (a, b) = linear_equation(left, right);
    (a * point.0 + b - point.1).abs() <= tolerance
}

/// Assemble the plate text from the character boxes of the OCR model.
///
/// Returns `None`, the "unknown" reading, when the character count is implausible for
/// a plate. Characters that do not all sit on the line through the leftmost and rightmost
/// one make a two line plate, written `top-bottom`.
pub fn read_plate(chars: &[Detection], config: &ReaderConfig) -> Option<String> {
    if chars.is_empty() || chars.len() < config.min_chars || chars.len() > config.max_chars {
        return None;
    }
    let centers: Vec<CharCenter> = chars.iter().map(|det| {
        let (x, y) = det.bbox.center();
        CharCenter { x, y, class: det.class }
    }).collect();

    let mut left = centers[0];
    let mut right = centers[0];
    for c in &centers {
        if c.x < left.x {
            left = *c;
        }
        if c.x > right.x {
            right = *c;
        }
    }
    let two_lines = left.x != right.x && centers.iter().any(|c| {
        !on_line((c.x, c.y), (left.x, left.y), (right.x, right.y), config.line_tolerance)
    });

    let label = |c: &CharCenter| config.labels.get(c.class).map(String::as_str).unwrap_or("?");
    let join = |mut line: Vec<CharCenter>| -> String {
        line.sort_by(|a, b| a.x.partial_cmp(&b.x).unwrap_or(std::cmp::Ordering::Equal));
        line.iter().map(|c| label(c)).collect()
    };

    if two_lines {
        let y_sum: f32 = centers.iter().map(|c| c.y).sum();
        let y_mean = (y_sum.trunc() as i64) / centers.len() as i64;
        let (bottom, top): (Vec<CharCenter>, Vec<CharCenter>) = centers.into_iter()
            .partition(|c| c.y.trunc() as i64 > y_mean);
        Some(format!("{}-{}", join(top), join(bottom)))
    } else {
        Some(join(centers))
    }
}


#[cfg(test)]
mod test {

    use super::*;
    use crate::model::BoundingBox;

    // class ids into the default labels: "1".."9" are 0..8, "A" is 9, "0" is 29
    fn ch(class: usize, cx: f32, cy: f32) -> Detection {
        Detection { bbox: BoundingBox::new(cx - 4.0, cy - 6.0, cx + 4.0, cy + 6.0), score: 0.9, class }
    }

    #[test]
    fn single_line_sorted_left_to_right() {
        let config = ReaderConfig::default();
        let chars = vec![
            ch(8, 70.0, 20.0), ch(0, 10.0, 20.0), ch(9, 30.0, 20.5), ch(1, 20.0, 19.5),
            ch(29, 60.0, 21.0), ch(4, 50.0, 20.0), ch(2, 40.0, 20.0),
        ];
        assert_eq!(read_plate(&chars, &config), Some("12A3509".to_string()));
    }

    #[test]
    fn tilted_single_line_stays_single() {
        let config = ReaderConfig::default();
        let chars: Vec<Detection> = (0..8).map(|i| ch(i, 10.0 + i as f32 * 10.0, 20.0 + i as f32 * 2.0)).collect();
        assert_eq!(read_plate(&chars, &config), Some("12345678".to_string()));
    }

    #[test]
    fn two_line_plate() {
        let config = ReaderConfig::default();
        let chars = vec![
            // top: 5 9 A 1
            ch(4, 10.0, 10.0), ch(8, 20.0, 10.0), ch(9, 30.0, 10.0), ch(0, 40.0, 10.0),
            // bottom: 2 3 4 5
            ch(1, 10.0, 40.0), ch(2, 20.0, 40.0), ch(3, 30.0, 40.0), ch(4, 40.0, 41.0),
        ];
        assert_eq!(read_plate(&chars, &config), Some("59A1-2345".to_string()));
    }

    #[test]
    fn implausible_counts_are_unknown() {
        let config = ReaderConfig::default();
        let six: Vec<Detection> = (0..6).map(|i| ch(i, i as f32 * 10.0, 5.0)).collect();
        let eleven: Vec<Detection> = (0..11).map(|i| ch(i, i as f32 * 10.0, 5.0)).collect();
        assert_eq!(read_plate(&[], &config), None);
        assert_eq!(read_plate(&six, &config), None);
        assert_eq!(read_plate(&eleven, &config), None);
    }

    #[test]
    fn stacked_characters_need_distinct_x() {
        // leftmost and rightmost share x, so the line test is skipped
        let config = ReaderConfig { min_chars: 2, ..ReaderConfig::default() };
        let chars = vec![ch(0, 10.0, 10.0), ch(1, 10.0, 40.0)];
        assert_eq!(read_plate(&chars, &config).map(|s| s.len()), Some(2));
    }

    #[test]
    fn unknown_class_is_marked() {
        let config = ReaderConfig { min_chars: 1, ..ReaderConfig::default() };
        assert_eq!(read_plate(&[ch(99, 1.0, 1.0)], &config), Some("?".to_string()));
    }
}
