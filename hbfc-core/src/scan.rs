//! Picking an access point out of a scan.

/// What the selection needs from a scan result.
pub trait ScanEntry {
    fn ssid(&self) -> &str;
    fn rssi(&self) -> i8;
}

/// The strongest entry advertising `ssid`.
///
/// An empty `ssid` never matches, so a node without stored credentials
/// always comes out of the scan empty-handed.
pub fn strongest<'a, E: ScanEntry>(entries: &'a [E], ssid: &str) -> Option<&'a E> {
    if ssid.is_empty() {
        return None;
    }
    entries
        .iter()
        .filter(|entry| entry.ssid() == ssid)
        .max_by_key(|entry| entry.rssi())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Entry {
        ssid: &'static str,
        rssi: i8,
        bssid: [u8; 6],
    }

    impl ScanEntry for Entry {
        fn ssid(&self) -> &str {
            self.ssid
        }
        fn rssi(&self) -> i8 {
            self.rssi
        }
    }

    fn entry(ssid: &'static str, rssi: i8, tag: u8) -> Entry {
        Entry {
            ssid,
            rssi,
            bssid: [0x02, 0, 0, 0, 0, tag],
        }
    }

    #[test]
    fn picks_the_strongest_signal() {
        let entries = [entry("net", -80, 1), entry("net", -40, 2), entry("net", -65, 3)];
        let chosen = strongest(&entries, "net").map(|entry| entry.bssid);
        assert_eq!(chosen, Some([0x02, 0, 0, 0, 0, 2]));
    }

    #[test]
    fn ignores_other_networks() {
        let entries = [entry("neighbour", -20, 1), entry("net", -70, 2)];
        assert_eq!(strongest(&entries, "net").map(|entry| entry.rssi), Some(-70));
        assert!(strongest(&entries, "missing").is_none());
    }

    #[test]
    fn empty_ssid_matches_nothing() {
        let entries = [entry("", -30, 1)];
        assert!(strongest(&entries, "").is_none());
    }
}
