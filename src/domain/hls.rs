use std::fmt;

pub struct MediaSegment {
    pub duration: f64,
    pub uri: String,
}

pub struct MediaPlaylist {
    pub version: u8,
    pub target_duration: u64,
    pub media_sequence: u64,
    pub segments: Vec<MediaSegment>,
    pub end_list: bool,
    pub playlist_type: Option<String>,
    pub independent_segments: bool,
    /// Initialization segment for fMP4 (EXT-X-MAP)
    pub init_segment: Option<String>,
}

impl MediaPlaylist {
    pub fn new(target_duration: u64) -> Self {
        Self {
            version: 3,
            target_duration,
            media_sequence: 0,
            segments: Vec::new(),
            end_list: true,
            playlist_type: None,
            independent_segments: false,
            init_segment: None,
        }
    }

    pub fn add_segment(&mut self, duration: f64, uri: String) {
        self.segments.push(MediaSegment { duration, uri });
    }
}

impl fmt::Display for MediaPlaylist {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "#EXTM3U")?;
        writeln!(f, "#EXT-X-VERSION:{}", self.version)?;
        writeln!(f, "#EXT-X-TARGETDURATION:{}", self.target_duration)?;
        writeln!(f, "#EXT-X-MEDIA-SEQUENCE:{}", self.media_sequence)?;

        if let Some(pt) = &self.playlist_type {
            writeln!(f, "#EXT-X-PLAYLIST-TYPE:{}", pt)?;
        }

        if self.independent_segments {
            writeln!(f, "#EXT-X-INDEPENDENT-SEGMENTS")?;
        }

        // fMP4 initialization segment
        if let Some(init) = &self.init_segment {
            writeln!(f, "#EXT-X-MAP:URI=\"{}\"", init)?;
        }

        for segment in &self.segments {
            writeln!(f, "#EXTINF:{:.6},", segment.duration)?;
            writeln!(f, "{}", segment.uri)?;
        }

        if self.end_list {
            writeln!(f, "#EXT-X-ENDLIST")?;
        }

        Ok(())
    }
}

/// `#EXT-X-MEDIA` subtitle rendition.
pub struct SubtitleRendition {
    pub group_id: String,
    pub name: String,
    pub language: Option<String>,
    pub is_default: bool,
    pub is_forced: bool,
    pub uri: String,
}

/// `#EXT-X-STREAM-INF` entry.
pub struct VariantStream {
    pub bandwidth: u64,
    pub codecs: Option<String>,
    pub subtitles_group: Option<String>,
    pub uri: String,
}

#[derive(Default)]
pub struct MasterPlaylist {
    pub subtitles: Vec<SubtitleRendition>,
    pub variants: Vec<VariantStream>,
}

fn yes_no(flag: bool) -> &'static str {
    if flag {
        "YES"
    } else {
        "NO"
    }
}

impl fmt::Display for MasterPlaylist {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "#EXTM3U")?;

        for rendition in &self.subtitles {
            write!(
                f,
                "#EXT-X-MEDIA:TYPE=SUBTITLES,GROUP-ID=\"{}\",NAME=\"{}\",DEFAULT={},FORCED={},AUTOSELECT=YES",
                rendition.group_id,
                rendition.name,
                yes_no(rendition.is_default),
                yes_no(rendition.is_forced),
            )?;
            if let Some(language) = &rendition.language {
                write!(f, ",LANGUAGE=\"{}\"", language)?;
            }
            writeln!(f, ",URI=\"{}\"", rendition.uri)?;
        }

        for variant in &self.variants {
            write!(f, "#EXT-X-STREAM-INF:BANDWIDTH={}", variant.bandwidth)?;
            if let Some(codecs) = &variant.codecs {
                write!(f, ",CODECS=\"{}\"", codecs)?;
            }
            if let Some(group) = &variant.subtitles_group {
                write!(f, ",SUBTITLES=\"{}\"", group)?;
            }
            writeln!(f)?;
            writeln!(f, "{}", variant.uri)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_playlist_metadata() {
        let mut playlist = MediaPlaylist::new(10);
        playlist.playlist_type = Some("VOD".to_string());
        playlist.independent_segments = true;
        playlist.add_segment(9.5, "segment_0.ts".to_string());

        let content = playlist.to_string();

        assert!(content.starts_with("#EXTM3U\n#EXT-X-VERSION:3\n"));
        assert!(content.contains("#EXT-X-PLAYLIST-TYPE:VOD"));
        assert!(content.contains("#EXT-X-INDEPENDENT-SEGMENTS"));
        assert!(content.contains("#EXT-X-TARGETDURATION:10"));
        assert!(content.contains("#EXTINF:9.500000,\nsegment_0.ts\n"));
        assert!(content.ends_with("#EXT-X-ENDLIST\n"));
    }

    #[test]
    fn test_playlist_init_segment() {
        let mut playlist = MediaPlaylist::new(6);
        playlist.version = 7;
        playlist.init_segment = Some("0.m4s".to_string());
        let content = playlist.to_string();
        assert!(content.contains("#EXT-X-VERSION:7"));
        assert!(content.contains("#EXT-X-MAP:URI=\"0.m4s\"\n"));
    }

    #[test]
    fn test_master_playlist_layout() {
        let master = MasterPlaylist {
            subtitles: vec![SubtitleRendition {
                group_id: "subs".to_string(),
                name: "English".to_string(),
                language: Some("eng".to_string()),
                is_default: true,
                is_forced: false,
                uri: "subs/2.m3u8".to_string(),
            }],
            variants: vec![VariantStream {
                bandwidth: 4_128_000,
                codecs: None,
                subtitles_group: Some("subs".to_string()),
                uri: "main/playlist.m3u8".to_string(),
            }],
        };
        let content = master.to_string();
        assert_eq!(
            content,
            "#EXTM3U\n\
             #EXT-X-MEDIA:TYPE=SUBTITLES,GROUP-ID=\"subs\",NAME=\"English\",DEFAULT=YES,FORCED=NO,AUTOSELECT=YES,LANGUAGE=\"eng\",URI=\"subs/2.m3u8\"\n\
             #EXT-X-STREAM-INF:BANDWIDTH=4128000,SUBTITLES=\"subs\"\n\
             main/playlist.m3u8\n"
        );
    }
}
