use serde_json::Value;

/// Field the store stamps with a push id on sequenced creates.
pub const SEQUENCE_FIELD: &str = "seq";

/// Generates append keys that sort in creation order.
///
/// A key is 12 hex digits of epoch milliseconds followed by 8 hex digits of a
/// per-millisecond counter. The millisecond part never goes backwards, so keys
/// stay monotonic even if the wall clock does.
#[derive(Debug, Default)]
pub struct PushIdGenerator {
    last: Option<(u64, u32)>,
}

impl PushIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// A generator whose ids sort after every push id already in `root`:
    /// push keys anywhere in the tree, and [`SEQUENCE_FIELD`] stamps.
    pub fn seeded_from(root: &Value) -> Self {
        let mut ids = Self::new();
        ids.seed(root);
        ids
    }

    fn seed(&mut self, value: &Value) {
        let Value::Object(children) = value else {
            return;
        };
        for (key, child) in children {
            self.observe(key);
            if key == SEQUENCE_FIELD
                && let Value::String(stamp) = child
            {
                self.observe(stamp);
            }
            self.seed(child);
        }
    }

    /// Make later ids sort after `id`, if it is a push id.
    pub fn observe(&mut self, id: &str) {
        if let Some(seen) = parse(id)
            && self.last.is_none_or(|last| seen > last)
        {
            self.last = Some(seen);
        }
    }

    pub fn next_id(&mut self, now_ms: i64) -> String {
        let now = u64::try_from(now_ms).unwrap_or(0);
        let (ms, counter) = match self.last {
            Some((last_ms, _)) if now > last_ms => (now, 0),
            Some((last_ms, u32::MAX)) => (last_ms + 1, 0),
            Some((last_ms, counter)) => (last_ms, counter + 1),
            None => (now, 0),
        };
        self.last = Some((ms, counter));
        format!("{ms:012x}{counter:08x}")
    }
}

fn parse(id: &str) -> Option<(u64, u32)> {
    if id.len() != 20 || !id.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
        return None;
    }
    let ms = u64::from_str_radix(&id[..12], 16).ok()?;
    let counter = u32::from_str_radix(&id[12..], 16).ok()?;
    Some((ms, counter))
}
