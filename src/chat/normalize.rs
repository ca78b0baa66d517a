//! Light cleanup of model answers before they are spoken

/// Boilerplate openings models like to start with
const PREAMBLES: &[&str] = &["我是AI助手，", "作为AI助手，", "作为人工智能，"];

/// Collapse doubled punctuation, drop rote preambles, trim
#[must_use]
pub fn normalize(answer: &str) -> String {
    let mut text = answer.to_string();
    for (doubled, single) in [("。。", "。"), ("，，", "，")] {
        while text.contains(doubled) {
            text = text.replace(doubled, single);
        }
    }

    let mut rest = text.trim_start();
    for preamble in PREAMBLES {
        if let Some(stripped) = rest.strip_prefix(preamble) {
            rest = stripped;
        }
    }

    rest.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collapses_doubled_punctuation() {
        assert_eq!(normalize("好的。。。明白，，了"), "好的。明白，了");
    }

    #[test]
    fn strips_preamble() {
        assert_eq!(normalize("  作为AI助手，今天是晴天。 "), "今天是晴天。");
        assert_eq!(normalize("我是AI助手，作为人工智能，你好"), "你好");
    }

    #[test]
    fn leaves_plain_text_alone() {
        assert_eq!(normalize("你好，世界"), "你好，世界");
    }
}
