//! Device/datacenter resolution and the startup caches.
//!
//! The resolver owns the device universe and three caches loaded once at
//! startup: regex→FSM (`reg2fsm.bin`, subsampled to the configured hit
//! rate), regex→devices and regex→datacenters. A lookup that misses falls
//! back to a linear scan of the device list with the compiled automaton.
//!
//! It also hosts the device-count optimization: when both operands of a set
//! relation match few enough devices, the relation is decided directly on
//! the device-identifier sets instead of on automata.

use std::{
    collections::{BTreeSet, HashMap, HashSet},
    fs::File,
    io::BufReader,
    path::Path,
};

use rand::{rngs::StdRng, Rng, SeedableRng};
use tracing::{debug, info};

use crate::{
    error::{Result, SimError},
    fsm::Fsm,
};

/// Default share of the FSM cache retained at startup.
pub const DEFAULT_CACHE_HIT_RATE: f64 = 0.95;
/// Default device-count threshold under which set relations are decided on
/// device sets.
pub const DEFAULT_DEV_OPT_THRESHOLD: usize = 1000;

/// The language data of one tree node, as seen by the relation shortcuts.
#[derive(Clone, Copy)]
pub struct LangView<'a> {
    pub regex: &'a str,
    pub fsm: &'a Fsm,
    pub devices: &'a BTreeSet<String>,
}

pub struct Resolver {
    devices: Vec<String>,
    device_set: HashSet<String>,
    dcs: Vec<String>,
    fsm_cache: HashMap<String, Fsm>,
    reg2dev: HashMap<String, Vec<String>>,
    reg2dc: HashMap<String, Vec<String>>,
    /// Trace mode: bound keys come from the device/DC caches. Off-trace the
    /// bounds are computed by enumerating the (finite) language.
    pub using_trace: bool,
    pub use_dev_opt: bool,
    pub dev_opt_threshold: usize,
}

impl Resolver {
    /// Load the caches of a run folder: `dcs.txt`, `devices.txt`,
    /// `regex_device_map.long` and the serialized `reg2fsm.bin` map, keeping
    /// a seeded random subsample of the FSM cache at the given hit rate.
    pub fn from_run_folder(folder: &Path, cache_hit_rate: f64) -> Result<Self> {
        let read_lines = |name: &str| -> Result<Vec<String>> {
            let path = folder.join(name);
            let text =
                std::fs::read_to_string(&path).map_err(|e| SimError::io(path.clone(), e))?;
            Ok(text.lines().map(str::to_owned).collect())
        };
        let dcs = read_lines("dcs.txt")?;
        let devices = read_lines("devices.txt")?;
        let device_set: HashSet<String> = devices.iter().cloned().collect();

        info!("loading the fsm cache");
        let cache_path = folder.join("reg2fsm.bin");
        let file = File::open(&cache_path).map_err(|e| SimError::io(cache_path.clone(), e))?;
        let full_cache: HashMap<String, Fsm> = bincode::deserialize_from(BufReader::new(file))
            .map_err(|e| SimError::Config(format!("corrupt fsm cache {cache_path:?}: {e}")))?;
        if full_cache.is_empty() {
            return Err(SimError::Config(format!("empty fsm cache {cache_path:?}")));
        }
        let mut rng = StdRng::seed_from_u64(0);
        let mut fsm_cache = HashMap::new();
        let mut keys: Vec<&String> = full_cache.keys().collect();
        keys.sort_unstable();
        for key in keys {
            if rng.random_range(1..=100) > (cache_hit_rate * 100.0) as u32 {
                continue;
            }
            fsm_cache.insert(key.clone(), full_cache[key].clone());
        }
        info!(
            hit_rate = fsm_cache.len() as f64 / full_cache.len() as f64,
            "fsm cache subsampled"
        );

        info!("generating the regex to device list cache");
        let map_path = folder.join("regex_device_map.long");
        let rows = std::fs::read_to_string(&map_path)
            .map_err(|e| SimError::io(map_path.clone(), e))?;
        let mut reg2dev = HashMap::new();
        for (i, row) in rows.lines().enumerate() {
            let Some((regex, devs)) = row.split_once('&') else {
                return Err(SimError::Config(format!(
                    "{map_path:?}:{}: expected `regex & [devices]`",
                    i + 1
                )));
            };
            let regex = regex.trim();
            if fsm_cache.contains_key(regex) {
                reg2dev.insert(regex.to_owned(), parse_list_literal(devs.trim()));
            }
        }

        info!("generating the regex to dc list cache");
        let mut reg2dc = HashMap::new();
        for regex in reg2dev.keys() {
            reg2dc.insert(regex.clone(), dcs_of_regex(regex, &dcs)?);
        }

        Ok(Resolver {
            devices,
            device_set,
            dcs,
            fsm_cache,
            reg2dev,
            reg2dc,
            using_trace: true,
            use_dev_opt: false,
            dev_opt_threshold: DEFAULT_DEV_OPT_THRESHOLD,
        })
    }

    /// An in-memory resolver over an explicit universe, with empty caches.
    /// Used by the scenario tests in place of the on-disk run folders.
    pub fn in_memory(
        devices: impl IntoIterator<Item = impl Into<String>>,
        dcs: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        let devices: Vec<String> = devices.into_iter().map(Into::into).collect();
        Resolver {
            device_set: devices.iter().cloned().collect(),
            devices,
            dcs: dcs.into_iter().map(Into::into).collect(),
            fsm_cache: HashMap::new(),
            reg2dev: HashMap::new(),
            reg2dc: HashMap::new(),
            using_trace: false,
            use_dev_opt: false,
            dev_opt_threshold: DEFAULT_DEV_OPT_THRESHOLD,
        }
    }

    /// Compile a regex, taking the cached automaton when present.
    pub fn fsm_for(&self, regex: &str) -> Result<Fsm> {
        match self.fsm_cache.get(regex) {
            Some(fsm) => Ok(fsm.clone()),
            None => Fsm::from_regex(regex),
        }
    }

    /// Devices matched by a regex: the cached list when present, otherwise a
    /// linear scan of the device universe with the automaton.
    pub fn matched_devices(&self, regex: &str, fsm: &Fsm) -> BTreeSet<String> {
        if let Some(cached) = self.reg2dev.get(regex) {
            return cached.iter().cloned().collect();
        }
        self.devices
            .iter()
            .filter(|d| fsm.matches(d))
            .cloned()
            .collect()
    }

    /// Datacenters matched by a regex, via the cache or by extracting the DC
    /// token of every matched device.
    pub fn matched_dcs(&self, regex: &str, fsm: &Fsm) -> Result<Vec<String>> {
        if self.reg2dev.contains_key(regex) {
            return Ok(self.reg2dc[regex].clone());
        }
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for device in self.matched_devices(regex, fsm) {
            let Some(dc) = dc_token(&device) else {
                return Err(SimError::Invariant(format!(
                    "device {device:?} carries no datacenter token"
                )));
            };
            if seen.insert(dc.to_owned()) {
                out.push(dc.to_owned());
            }
        }
        Ok(out)
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    pub fn datacenters(&self) -> &[String] {
        &self.dcs
    }

    /// Whether the text is itself a device identifier of the universe.
    pub fn is_known_device(&self, name: &str) -> bool {
        self.device_set.contains(name)
    }

    fn is_single_device(&self, v: LangView<'_>) -> bool {
        if self.use_dev_opt {
            return v.devices.len() == 1;
        }
        self.device_set.contains(&unescape_dots(v.regex))
    }

    fn small_sets(&self, a: LangView<'_>, b: LangView<'_>) -> bool {
        self.use_dev_opt
            && !a.devices.is_empty()
            && !b.devices.is_empty()
            && (a.devices.len() < self.dev_opt_threshold
                || b.devices.len() < self.dev_opt_threshold)
    }

    /// `L(a) = L(b)`.
    pub fn lang_equal(&self, a: LangView<'_>, b: LangView<'_>) -> bool {
        if self.small_sets(a, b) {
            return a.devices == b.devices;
        }
        match (self.is_single_device(a), self.is_single_device(b)) {
            (true, true) => a.regex == b.regex,
            (true, false) | (false, true) => false,
            (false, false) => a.fsm.language_eq(b.fsm),
        }
    }

    /// `L(a) ⊇ L(b)` (equality included).
    pub fn lang_contains(&self, a: LangView<'_>, b: LangView<'_>) -> bool {
        if self.small_sets(a, b) {
            return a.devices.is_superset(b.devices);
        }
        match (self.is_single_device(a), self.is_single_device(b)) {
            (true, true) => a.regex == b.regex,
            (true, false) => false,
            (false, true) => a.fsm.matches(&unescape_dots(b.regex)),
            (false, false) => a.fsm.contains(b.fsm),
        }
    }

    /// `L(a) ⊃ L(b)`.
    pub fn lang_contains_proper(&self, a: LangView<'_>, b: LangView<'_>) -> bool {
        if self.small_sets(a, b) {
            return a.devices.is_superset(b.devices) && a.devices != b.devices;
        }
        match (self.is_single_device(a), self.is_single_device(b)) {
            (true, _) => false,
            (false, _) => a.fsm.contains_proper(b.fsm),
        }
    }

    /// `L(a) ∩ L(b) ≠ ∅`.
    pub fn lang_overlaps(&self, a: LangView<'_>, b: LangView<'_>) -> bool {
        if self.small_sets(a, b) {
            return !a.devices.is_disjoint(b.devices);
        }
        match (self.is_single_device(a), self.is_single_device(b)) {
            (true, true) => false,
            (true, false) => b.fsm.matches(&unescape_dots(a.regex)),
            (false, true) => a.fsm.matches(&unescape_dots(b.regex)),
            (false, false) => !a.fsm.is_disjoint(b.fsm),
        }
    }
}

/// Datacenters matched by the DC tail of a synthetic-trace regex (everything
/// from `_dc` on is itself a regex over DC names).
fn dcs_of_regex(regex: &str, dcs: &[String]) -> Result<Vec<String>> {
    let Some(at) = regex.find("_dc") else {
        return Err(SimError::Config(format!(
            "regex {regex:?} carries no datacenter part"
        )));
    };
    let tail = &regex[at..];
    debug!(regex, tail, "resolving datacenter tail");
    let fsm = Fsm::from_regex(tail)?;
    Ok(dcs.iter().filter(|dc| fsm.matches(dc)).cloned().collect())
}

/// Extract the `_dcNNNN_<cluster>` token of a device identifier.
fn dc_token(device: &str) -> Option<&str> {
    let at = device.find("_dc")?;
    let rest = &device[at..];
    let bytes = rest.as_bytes();
    // `_dc` + four digits + `_` + a digit or lowercase run.
    if bytes.len() < 9 || !bytes[3..7].iter().all(u8::is_ascii_digit) || bytes[7] != b'_' {
        return None;
    }
    let tail = &bytes[8..];
    let run = if tail[0].is_ascii_digit() {
        tail.iter().take_while(|b| b.is_ascii_digit()).count()
    } else {
        tail.iter().take_while(|b| b.is_ascii_lowercase()).count()
    };
    (run > 0).then(|| &rest[..8 + run])
}

/// Parse a `[a, b, c]` style list literal with optionally quoted items.
pub(crate) fn parse_list_literal(text: &str) -> Vec<String> {
    let inner = text
        .trim()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .trim();
    if inner.is_empty() {
        return Vec::new();
    }
    inner
        .split(',')
        .map(|item| item.trim().trim_matches(|c| c == '\'' || c == '"').to_owned())
        .collect()
}

fn unescape_dots(regex: &str) -> String {
    regex.replace("\\.", ".")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view<'a>(regex: &'a str, fsm: &'a Fsm, devices: &'a BTreeSet<String>) -> LangView<'a> {
        LangView {
            regex,
            fsm,
            devices,
        }
    }

    #[test]
    fn scan_fallback_matches_whole_identifiers() {
        let rl = Resolver::in_memory(["d0dc1", "d1dc1", "d2dc1"], ["dc1"]);
        let fsm = rl.fsm_for("d[0-1]dc1").unwrap();
        let matched = rl.matched_devices("d[0-1]dc1", &fsm);
        assert_eq!(
            matched.into_iter().collect::<Vec<_>>(),
            vec!["d0dc1", "d1dc1"]
        );
    }

    #[test]
    fn dc_token_extraction() {
        assert_eq!(dc_token("tor4_pod2_dc0001_12"), Some("_dc0001_12"));
        assert_eq!(dc_token("agg1_dc0203_west"), Some("_dc0203_west"));
        assert_eq!(dc_token("d0dc1"), None);
        assert_eq!(dc_token("x_dc12_3"), None);
    }

    #[test]
    fn list_literal_parsing() {
        assert_eq!(
            parse_list_literal("['a', 'b', 'c']"),
            vec!["a", "b", "c"]
        );
        assert_eq!(parse_list_literal("[]"), Vec::<String>::new());
        assert_eq!(parse_list_literal("[\"x\"]"), vec!["x"]);
    }

    #[test]
    fn device_count_shortcut_decides_on_sets() {
        let mut rl = Resolver::in_memory(["d0dc1", "d1dc1", "d2dc1"], ["dc1"]);
        rl.use_dev_opt = true;
        let all = rl.fsm_for("d[0-2]dc1").unwrap();
        let one = rl.fsm_for("d0dc1").unwrap();
        let all_devs = rl.matched_devices("d[0-2]dc1", &all);
        let one_devs = rl.matched_devices("d0dc1", &one);
        let a = view("d[0-2]dc1", &all, &all_devs);
        let b = view("d0dc1", &one, &one_devs);
        assert!(rl.lang_contains(a, b));
        assert!(rl.lang_contains_proper(a, b));
        assert!(rl.lang_overlaps(a, b));
        assert!(!rl.lang_equal(a, b));
    }

    #[test]
    fn single_device_relations_without_dev_opt() {
        let rl = Resolver::in_memory(["d0dc1", "d1dc1"], ["dc1"]);
        let wide = rl.fsm_for("d[0-1]dc1").unwrap();
        let single = rl.fsm_for("d0dc1").unwrap();
        let none = BTreeSet::new();
        let a = view("d[0-1]dc1", &wide, &none);
        let b = view("d0dc1", &single, &none);
        // `d0dc1` is in the device universe, so it takes the single-device
        // paths: text match against the wider language.
        assert!(rl.lang_contains(a, b));
        assert!(rl.lang_overlaps(a, b));
        assert!(!rl.lang_equal(a, b));
        assert!(!rl.lang_contains(b, a));
    }
}
