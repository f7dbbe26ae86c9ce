use regex::{Captures, Regex};

/// 源码游标：在不可变源码上按需匹配定界符与文本
pub struct Scanner<'s> {
    source: &'s str,
    pos: usize,
}

impl<'s> Scanner<'s> {
    pub fn new(source: &'s str) -> Self {
        Self { source, pos: 0 }
    }

    pub fn source(&self) -> &'s str {
        self.source
    }

    pub fn eos(&self) -> bool {
        self.pos >= self.source.len()
    }

    pub fn rest(&self) -> &'s str {
        &self.source[self.pos..]
    }

    /// 前瞻至多 `n` 个字符，用于错误诊断
    pub fn peek(&self, n: usize) -> &'s str {
        let rest = self.rest();
        match rest.char_indices().nth(n) {
            Some((end, _)) => &rest[..end],
            None => rest,
        }
    }

    pub fn starts_with(&self, lit: &str) -> bool {
        self.rest().starts_with(lit)
    }

    /// 匹配字面量并前移游标
    pub fn scan_str(&mut self, lit: &str) -> bool {
        if self.starts_with(lit) {
            self.pos += lit.len();
            true
        } else {
            false
        }
    }

    /// 在当前位置锚定匹配 `re`（正则必须以 `^` 开头），成功则前移游标
    pub fn scan_re(&mut self, re: &Regex) -> Option<Captures<'s>> {
        let rest: &'s str = &self.source[self.pos..];
        let caps = re.captures(rest)?;
        let whole = caps.get(0)?;
        if whole.start() != 0 || whole.is_empty() {
            return None;
        }
        self.pos += whole.end();
        Some(caps)
    }

    /// 消耗满足 `pred` 的最长字符前缀
    pub fn scan_while(&mut self, pred: impl Fn(char) -> bool) -> &'s str {
        let rest = self.rest();
        let end = rest
            .char_indices()
            .find(|&(_, c)| !pred(c))
            .map(|(i, _)| i)
            .unwrap_or(rest.len());
        self.pos += end;
        &rest[..end]
    }

    pub fn next_char(&mut self) -> Option<char> {
        let c = self.rest().chars().next()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    /// 当前位置的行列号（均从 1 开始）
    pub fn line_col(&self) -> (usize, usize) {
        let consumed = &self.source[..self.pos];
        let line = consumed.matches('\n').count() + 1;
        let col = match consumed.rfind('\n') {
            Some(i) => consumed[i + 1..].chars().count() + 1,
            None => consumed.chars().count() + 1,
        };
        (line, col)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_re_is_anchored() {
        let re = Regex::new(r"^b+").unwrap();
        let mut scanner = Scanner::new("abb");
        assert!(scanner.scan_re(&re).is_none());
        assert!(scanner.scan_str("a"));
        assert_eq!(scanner.scan_re(&re).unwrap().get(0).unwrap().as_str(), "bb");
        assert!(scanner.eos());
    }

    #[test]
    fn test_line_col_tracks_newlines() {
        let mut scanner = Scanner::new("ab\ncd");
        scanner.scan_while(|c| c != 'd');
        assert_eq!(scanner.line_col(), (2, 2));
    }

    #[test]
    fn test_peek_limits_chars() {
        let scanner = Scanner::new("括号模板");
        assert_eq!(scanner.peek(2), "括号");
        assert_eq!(scanner.peek(10), "括号模板");
    }
}
