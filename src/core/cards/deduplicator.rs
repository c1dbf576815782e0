/// 结果去重：同一张牌连续识别只上报一次
pub fn should_report(label: &str, last_label: Option<&str>) -> bool {
    last_label != Some(label)
}

#[derive(Debug, Default)]
pub struct ResultDeduplicator {
    last_label: Option<String>,
}

impl ResultDeduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn should_report(&self, label: &str) -> bool {
        should_report(label, self.last_label.as_deref())
    }

    pub fn update(&mut self, label: &str) {
        self.last_label = Some(label.to_string());
    }

    pub fn last_label(&self) -> Option<&str> {
        self.last_label.as_deref()
    }

    pub fn reset(&mut self) {
        self.last_label = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repeat_suppressed() {
        let mut dedup = ResultDeduplicator::new();
        assert!(dedup.should_report("ace of spades"));
        dedup.update("ace of spades");
        assert!(!dedup.should_report("ace of spades"));
        assert!(dedup.should_report("king of hearts"));
    }

    #[test]
    fn test_reset_allows_repeat() {
        let mut dedup = ResultDeduplicator::new();
        dedup.update("ace of spades");
        dedup.reset();
        assert_eq!(dedup.last_label(), None);
        assert!(dedup.should_report("ace of spades"));
    }

    #[test]
    fn test_free_function() {
        assert!(should_report("two of clubs", None));
        assert!(!should_report("two of clubs", Some("two of clubs")));
    }
}
