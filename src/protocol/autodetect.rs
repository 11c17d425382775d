//! Protocol autodetection from the power-up announcement.
//!
//! The announcement is read without checksum verification (the rule is not
//! known yet), the model is resolved from the magic, and the model name is
//! matched against the dialect signature table. The concrete engine
//! re-validates the same announcement under its own checksum rule when it
//! takes over the link.

use regex::Regex;

use crate::error::{Error, Result};

use super::{
    await_announcement, identify_model, read_status_with_reack, Link, ProtocolKind, TargetState,
};

/// Dialect signatures over the model name. Lower rank wins when several
/// match: the specialized stc12a/stc15a patterns deliberately outrank their
/// generic siblings, preserving the historical resolution order. Equal
/// ranks (stc12 vs stc12b) cannot be told apart from the announcement.
const SIGNATURES: &[(&str, ProtocolKind, u8)] = &[
    (r"^STC(89|90)(C|LE)\d", ProtocolKind::Stc89, 0),
    (r"^STC12(C|LE)\d052", ProtocolKind::Stc12A, 1),
    (r"^STC12(C|LE)(52|56)", ProtocolKind::Stc12B, 2),
    (r"^(STC|IAP)(10|11|12)\D", ProtocolKind::Stc12, 2),
    (r"^(STC|IAP)15[FL][012]0\d(E|EA|)$", ProtocolKind::Stc15A, 3),
    (r"^(STC|IAP|IRC)15\D", ProtocolKind::Stc15, 4),
    (r"^(STC|IAP|IRC)8", ProtocolKind::Stc8, 5),
];

/// Map a model name to its dialect.
pub fn classify(model_name: &str) -> Result<ProtocolKind> {
    let mut matches: Vec<(ProtocolKind, u8)> = vec![];
    for (pattern, kind, rank) in SIGNATURES {
        let re = Regex::new(pattern).expect("signature table is well-formed");
        if re.is_match(model_name) {
            matches.push((*kind, *rank));
        }
    }

    let best = match matches.iter().map(|(_, rank)| *rank).min() {
        Some(best) => best,
        None => {
            return Err(Error::Protocol(format!(
                "cannot detect protocol for model {}",
                model_name
            )))
        }
    };
    let candidates: Vec<ProtocolKind> = matches
        .iter()
        .filter(|(_, rank)| *rank == best)
        .map(|(kind, _)| *kind)
        .collect();
    if candidates.len() == 1 {
        Ok(candidates[0])
    } else {
        Err(Error::AutodetectAmbiguous(
            candidates.iter().map(|k| k.as_str().to_string()).collect(),
        ))
    }
}

/// Wait for the announcement and classify the target. Returns the detected
/// dialect and the raw announcement payload (checksum bytes still
/// attached) for the concrete engine to adopt.
pub fn detect(link: &mut Link) -> Result<(ProtocolKind, Vec<u8>)> {
    let status = await_announcement(link, &mut |link| read_status_with_reack(link, None))?;

    let mut state = TargetState::default();
    identify_model(&mut state, &status)?;
    let model = state.model()?;
    log::debug!("announcement names {}", model);

    let kind = classify(&model.name)?;
    log::info!("Protocol detected: {}", kind);
    Ok((kind, status))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_each_family() {
        assert!(matches!(classify("STC89C52RC"), Ok(ProtocolKind::Stc89)));
        assert!(matches!(classify("STC90C58RD+"), Ok(ProtocolKind::Stc89)));
        assert!(matches!(classify("STC12C2052AD"), Ok(ProtocolKind::Stc12A)));
        assert!(matches!(classify("STC12C5A60S2"), Ok(ProtocolKind::Stc12)));
        assert!(matches!(classify("STC10F04XE"), Ok(ProtocolKind::Stc12)));
        assert!(matches!(classify("STC15F104E"), Ok(ProtocolKind::Stc15A)));
        assert!(matches!(classify("STC15F204EA"), Ok(ProtocolKind::Stc15A)));
        assert!(matches!(classify("IAP15F2K61S2"), Ok(ProtocolKind::Stc15)));
        assert!(matches!(classify("IRC15W4K58S4"), Ok(ProtocolKind::Stc15)));
        assert!(matches!(classify("STC8A8K64S4A12"), Ok(ProtocolKind::Stc8)));
    }

    #[test]
    fn stc12b_shaped_names_are_ambiguous() {
        match classify("STC12C5204AD") {
            Err(Error::AutodetectAmbiguous(candidates)) => {
                assert!(candidates.contains(&"stc12b".to_string()));
                assert!(candidates.contains(&"stc12".to_string()));
            }
            other => panic!("expected ambiguity, got {:?}", other.map(|k| k.as_str())),
        }
    }

    #[test]
    fn specialized_signatures_win_over_generic_ones() {
        // matches both the stc15a and stc15 signatures
        assert!(matches!(classify("STC15F104W"), Ok(ProtocolKind::Stc15A)));
        // matches both the stc12a and stc12 signatures
        assert!(matches!(classify("STC12LE4052AD"), Ok(ProtocolKind::Stc12A)));
    }

    #[test]
    fn unknown_names_are_rejected() {
        assert!(matches!(classify("AT89S52"), Err(Error::Protocol(_))));
    }
}
