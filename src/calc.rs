/*!
Module de calcul des métriques NTP

Offset, RTT et jitter à partir des 4 timestamps clés d'un échange :
- t1 : envoi client
- t2 : réception serveur
- t3 : envoi serveur
- t4 : réception client

Les différences sont calculées séparément sur les parties secondes et
fraction (entiers signés), puis converties en secondes flottantes.
*/

use crate::timestamp::NtpTimestamp;

/// Offset d'horloge client/serveur : ((t2 − t1) + (t3 − t4)) / 2, en secondes
pub fn offset(t1: NtpTimestamp, t2: NtpTimestamp, t3: NtpTimestamp, t4: NtpTimestamp) -> f64 {
    let a_sec = t2.seconds() as i64 - t1.seconds() as i64;
    let a_frac = t2.fraction() as i64 - t1.fraction() as i64;
    let b_sec = t3.seconds() as i64 - t4.seconds() as i64;
    let b_frac = t3.fraction() as i64 - t4.fraction() as i64;

    (a_sec + b_sec) as f64 / 2.0 + (a_frac + b_frac) as f64 / 2.0 / 2f64.powi(32)
}

/// Délai aller-retour : (t4 − t1) − (t3 − t2), en secondes
pub fn rtt(t1: NtpTimestamp, t2: NtpTimestamp, t3: NtpTimestamp, t4: NtpTimestamp) -> f64 {
    let a_sec = t4.seconds() as i64 - t1.seconds() as i64;
    let a_frac = t4.fraction() as i64 - t1.fraction() as i64;
    let b_sec = t3.seconds() as i64 - t2.seconds() as i64;
    let b_frac = t3.fraction() as i64 - t2.fraction() as i64;

    (a_sec - b_sec) as f64 + (a_frac - b_frac) as f64 / 2f64.powi(32)
}

/// Offset à partir des timestamps flottants au format RIPE
/// (champs `origin-ts`, `receive-ts`, `transmit-ts`, `final-ts`)
pub fn offset_from_ripe_fields(origin: f64, receive: f64, transmit: f64, final_ts: f64) -> f64 {
    ((receive - origin) + (transmit - final_ts)) / 2.0
}

/// Jitter d'une série d'offsets : écart quadratique moyen par rapport au
/// premier offset, dénominateur n − 1. Zéro si la série a au plus un élément.
pub fn jitter(offsets: &[f64]) -> f64 {
    if offsets.len() <= 1 {
        return 0.0;
    }
    let first = offsets[0];
    let sum: f64 = offsets[1..].iter().map(|o| (o - first) * (o - first)).sum();
    (sum / (offsets.len() - 1) as f64).sqrt()
}
