//! Recognizer-clock to wall-clock reconciliation.
//!
//! The recognizer compresses silent stretches of its input, so its
//! timestamps count voiced time, not elapsed time. Mapping back runs through
//! the chunk's detected-speech regions: a recognizer instant `t_r` lands
//! `t_r` voiced-milliseconds into the region sequence. This module is the
//! only place chunk offsets are applied; downstream never adds them again.

use crate::transcribe::RawSegment;
use crate::types::{SpeechRegion, TranscriptSegment, WordTiming};

/// Map one recognizer-local instant to audio-local time.
///
/// With no regions the clock is taken at face value. Past the last region's
/// voiced time the result clamps to that region's end. The mapping is
/// monotonic non-decreasing for non-decreasing inputs.
pub fn map_instant(regions: &[SpeechRegion], t_r: u64) -> u64 {
    if regions.is_empty() {
        return t_r;
    }
    let mut voiced = 0u64;
    for region in regions {
        let len = region.duration_ms();
        if t_r < voiced + len {
            return region.start_ms + (t_r - voiced);
        }
        voiced += len;
    }
    regions[regions.len() - 1].end_ms
}

/// Reconcile a recognizer's segments for one chunk into session-global
/// transcript segments.
///
/// Segment starts are mapped through the regions; ends preserve the
/// recognizer's duration, clamped into the chunk. Words are mapped the same
/// way and then clamped into their segment. The chunk's session offset is
/// applied here, once.
pub fn reconcile_segments(
    regions: &[SpeechRegion],
    raw: &[RawSegment],
    chunk_start_ms: u64,
    chunk_duration_ms: u64,
    speaker: &str,
) -> Vec<TranscriptSegment> {
    let mut out: Vec<TranscriptSegment> = raw
        .iter()
        .map(|segment| {
            let start = map_instant(regions, segment.start_ms).min(chunk_duration_ms);
            let duration = segment.end_ms.saturating_sub(segment.start_ms);
            let end = (start + duration).min(chunk_duration_ms).max(start);

            let words: Vec<WordTiming> = segment
                .words
                .iter()
                .map(|word| {
                    let w_start = map_instant(regions, word.start_ms).clamp(start, end);
                    let w_duration = word.end_ms.saturating_sub(word.start_ms);
                    let w_end = (w_start + w_duration).clamp(w_start, end);
                    WordTiming {
                        start_ms: w_start + chunk_start_ms,
                        end_ms: w_end + chunk_start_ms,
                        text: word.text.clone(),
                        confidence: word.probability.clamp(0.0, 1.0),
                    }
                })
                .collect();

            TranscriptSegment {
                start_ms: start + chunk_start_ms,
                end_ms: end + chunk_start_ms,
                text: segment.text.clone(),
                speaker: speaker.to_string(),
                words: (!words.is_empty()).then_some(words),
            }
        })
        .collect();

    out.sort_by_key(|s| (s.start_ms, s.end_ms));
    out
}

/// Merge the two channels' reconciled segments into reading order.
pub fn merge_dialogue(
    mic: &[TranscriptSegment],
    sys: &[TranscriptSegment],
) -> Vec<TranscriptSegment> {
    let mut merged: Vec<TranscriptSegment> = mic.iter().chain(sys).cloned().collect();
    merged.sort_by_key(|s| (s.start_ms, s.end_ms));
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transcribe::RawWord;

    fn region(start_ms: u64, end_ms: u64) -> SpeechRegion {
        SpeechRegion { start_ms, end_ms }
    }

    fn raw(start_ms: u64, end_ms: u64, text: &str) -> RawSegment {
        RawSegment {
            start_ms,
            end_ms,
            text: text.into(),
            words: Vec::new(),
        }
    }

    #[test]
    fn empty_regions_is_identity() {
        assert_eq!(map_instant(&[], 4200), 4200);
    }

    #[test]
    fn maps_through_leading_silence() {
        // 3 s of silence before the only speech region: recognizer time 0
        // is the region start.
        let regions = [region(3000, 5000)];
        assert_eq!(map_instant(&regions, 0), 3000);
        assert_eq!(map_instant(&regions, 1200), 4200);
    }

    #[test]
    fn clamps_past_total_voiced_time() {
        let regions = [region(1000, 2000), region(4000, 5000)];
        // 2000 ms of voiced time total.
        assert_eq!(map_instant(&regions, 2000), 5000);
        assert_eq!(map_instant(&regions, 9999), 5000);
    }

    #[test]
    fn skips_inter_region_silence() {
        let regions = [region(1000, 2000), region(4000, 5000)];
        assert_eq!(map_instant(&regions, 500), 1500);
        // Voiced ms 1000 is the first instant of the second region.
        assert_eq!(map_instant(&regions, 1000), 4000);
        assert_eq!(map_instant(&regions, 1500), 4500);
    }

    #[test]
    fn touching_regions_share_the_boundary() {
        let regions = [region(1000, 2000), region(2000, 3000)];
        assert_eq!(map_instant(&regions, 1000), 2000);
    }

    #[test]
    fn full_coverage_is_identity() {
        let regions = [region(0, 1500), region(1500, 4000)];
        for t in [0, 1, 700, 1500, 2750, 3999] {
            assert_eq!(map_instant(&regions, t), t);
        }
        assert_eq!(map_instant(&regions, 4000), 4000);
    }

    #[test]
    fn mapping_is_monotonic() {
        let regions = [region(500, 900), region(2000, 2100), region(3000, 4500)];
        let mut last = 0;
        for t in (0..3000).step_by(37) {
            let mapped = map_instant(&regions, t);
            assert!(mapped >= last, "t={t}: {mapped} < {last}");
            last = mapped;
        }
    }

    #[test]
    fn stereo_channels_land_on_their_own_turns() {
        // Mic silent until 4000 then speaks to 5000; sys speaks 1000-2000.
        // Each channel's recognizer compressed its own leading silence.
        let mic_regions = [region(4000, 5000)];
        let sys_regions = [region(1000, 2000)];
        let chunk_start = 7000;

        let mic = reconcile_segments(&mic_regions, &[raw(0, 1000, "hello")], chunk_start, 5000, "mic");
        let sys = reconcile_segments(&sys_regions, &[raw(0, 1000, "hi")], chunk_start, 5000, "sys");

        assert_eq!((mic[0].start_ms, mic[0].end_ms), (11_000, 12_000));
        assert_eq!((sys[0].start_ms, sys[0].end_ms), (8_000, 9_000));

        let dialogue = merge_dialogue(&mic, &sys);
        assert_eq!(dialogue[0].text, "hi");
        assert_eq!(dialogue[1].text, "hello");
    }

    #[test]
    fn segment_duration_is_preserved() {
        let regions = [region(2000, 2600)];
        let segments = reconcile_segments(&regions, &[raw(100, 500, "x")], 0, 4000, "mic");
        assert_eq!(segments[0].start_ms, 2100);
        assert_eq!(segments[0].end_ms, 2500);
    }

    #[test]
    fn segment_end_clamps_into_chunk() {
        let regions = [region(3500, 3900)];
        // Recognizer claims a 2 s segment near the end of a 4 s chunk.
        let segments = reconcile_segments(&regions, &[raw(0, 2000, "x")], 0, 4000, "mic");
        assert_eq!(segments[0].start_ms, 3500);
        assert_eq!(segments[0].end_ms, 4000);
    }

    #[test]
    fn words_stay_inside_their_segment() {
        let regions = [region(1000, 2000)];
        let raw_segments = [RawSegment {
            start_ms: 0,
            end_ms: 900,
            text: "two words".into(),
            words: vec![
                RawWord {
                    start_ms: 0,
                    end_ms: 400,
                    text: "two".into(),
                    probability: 0.9,
                },
                RawWord {
                    start_ms: 500,
                    end_ms: 1400,
                    text: "words".into(),
                    probability: 0.7,
                },
            ],
        }];
        let segments = reconcile_segments(&regions, &raw_segments, 500, 3000, "sys");
        let segment = &segments[0];
        let words = segment.words.as_ref().unwrap();
        assert_eq!(words.len(), 2);
        for word in words {
            assert!(word.start_ms >= segment.start_ms);
            assert!(word.end_ms <= segment.end_ms);
            assert!(word.start_ms <= word.end_ms);
        }
        assert!((words[1].confidence - 0.7).abs() < 1e-6);
    }

    #[test]
    fn output_is_sorted_by_start() {
        let regions = [region(0, 5000)];
        let raw_segments = [raw(3000, 3500, "b"), raw(100, 600, "a")];
        let segments = reconcile_segments(&regions, &raw_segments, 0, 5000, "mic");
        assert_eq!(segments[0].text, "a");
        assert_eq!(segments[1].text, "b");
    }
}
