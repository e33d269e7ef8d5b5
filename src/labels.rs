use std::borrow::Cow;

/// Classes of the certificate detector, in training index order.
pub const CLASS_NAMES: [&str; 8] = [
    "cholera",
    "covid",
    "date",
    "flu",
    "logo",
    "meningo",
    "signature",
    "yellowfever",
];

/// Human readable label of a class index.
///
/// Indices past the end of [`CLASS_NAMES`] (e.g. the 80 COCO classes of the
/// pretrained fallback weights) are named `class_<index>`.
pub fn label_for(class_index: u32) -> Cow<'static, str> {
    match CLASS_NAMES.get(class_index as usize) {
        Some(name) => Cow::Borrowed(name),
        None => Cow::Owned(format!("class_{class_index}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_labels() {
        assert_eq!(label_for(0), "cholera");
        assert_eq!(label_for(6), "signature");
        assert_eq!(label_for(7), "yellowfever");
    }

    #[test]
    fn test_synthetic_labels() {
        assert_eq!(label_for(8), "class_8");
        assert_eq!(label_for(79), "class_79");
    }
}
