use std::fmt::Write;

use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;

use playback_core::SessionSnapshot;

use crate::state::AppState;

const STATES: [&str; 4] = ["active", "ended", "failed", "closed"];

pub async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    let mut out = String::with_capacity(4096);

    let mut sessions: Vec<SessionSnapshot> =
        state.sessions.iter().map(|e| e.value().snapshot()).collect();
    sessions.sort_by_key(|s| s.created_at);

    writeln!(out, "# TYPE playback_session info").unwrap();
    writeln!(out, "# HELP playback_session Information about a playback session").unwrap();
    for s in &sessions {
        writeln!(
            out,
            "playback_session_info{{session_id=\"{}\",source_kind=\"{}\",signed=\"{}\",created=\"{}\"}} 1",
            s.id,
            s.source.kind,
            s.source.signed,
            s.created_at.to_rfc3339()
        )
        .unwrap();
    }

    writeln!(out, "# TYPE playback_session_state stateset").unwrap();
    writeln!(out, "# HELP playback_session_state Current state of the playback session").unwrap();
    for s in &sessions {
        let current = s.state.name();
        for variant in STATES {
            writeln!(
                out,
                "playback_session_state{{session_id=\"{}\",playback_session_state=\"{}\"}} {}",
                s.id,
                variant,
                u8::from(current == variant)
            )
            .unwrap();
        }
    }

    writeln!(out, "# TYPE playback_session_active_tier_height gauge").unwrap();
    writeln!(
        out,
        "# HELP playback_session_active_tier_height Height in pixels of the tier being played"
    )
    .unwrap();
    for s in &sessions {
        if let Some(tier) = &s.active_tier {
            writeln!(
                out,
                "playback_session_active_tier_height{{session_id=\"{}\"}} {}",
                s.id, tier.height
            )
            .unwrap();
        }
    }

    writeln!(out, "# TYPE playback_session_active_tier_bitrate gauge").unwrap();
    writeln!(
        out,
        "# HELP playback_session_active_tier_bitrate Advertised bitrate of the tier being played"
    )
    .unwrap();
    for s in &sessions {
        if let Some(tier) = &s.active_tier {
            writeln!(
                out,
                "playback_session_active_tier_bitrate{{session_id=\"{}\"}} {}",
                s.id, tier.bitrate
            )
            .unwrap();
        }
    }

    writeln!(out, "# TYPE playback_session_fragments_loaded counter").unwrap();
    writeln!(
        out,
        "# HELP playback_session_fragments_loaded Fragments loaded since the session started"
    )
    .unwrap();
    for s in &sessions {
        writeln!(
            out,
            "playback_session_fragments_loaded_total{{session_id=\"{}\"}} {}",
            s.id, s.fragments_loaded
        )
        .unwrap();
    }

    writeln!(out, "# TYPE playback_session_faults counter").unwrap();
    writeln!(out, "# HELP playback_session_faults Engine faults by kind").unwrap();
    for s in &sessions {
        for (kind, count) in &s.fault_counts {
            writeln!(
                out,
                "playback_session_faults_total{{session_id=\"{}\",kind=\"{}\"}} {}",
                s.id, kind, count
            )
            .unwrap();
        }
    }

    writeln!(out, "# TYPE playback_session_position_seconds gauge").unwrap();
    writeln!(
        out,
        "# HELP playback_session_position_seconds Playback position within the stream"
    )
    .unwrap();
    for s in &sessions {
        writeln!(
            out,
            "playback_session_position_seconds{{session_id=\"{}\"}} {:.3}",
            s.id, s.transport.position
        )
        .unwrap();
    }

    writeln!(out, "# TYPE playback_session_uptime_seconds gauge").unwrap();
    writeln!(
        out,
        "# HELP playback_session_uptime_seconds Time since the session was created"
    )
    .unwrap();
    for s in &sessions {
        let uptime = (chrono::Utc::now() - s.created_at).num_milliseconds() as f64 / 1000.0;
        writeln!(
            out,
            "playback_session_uptime_seconds{{session_id=\"{}\"}} {:.3}",
            s.id, uptime
        )
        .unwrap();
    }

    writeln!(out, "# EOF").unwrap();

    (
        [(
            header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        out,
    )
}
