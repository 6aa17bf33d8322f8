//! Procedural personas. Everything a user looks and sounds like is a pure function of
//! their identity hash, so a returning browser gets the same creature back.

use serde::Serialize;

use super::identity::IdentityHash;
use crate::effects::VoiceParams;

const CREATURES: &[&str] = &[
    "Bulbizarre", "Herbizarre", "Florizarre", "Salamèche", "Reptincel", "Dracaufeu", "Carapuce",
    "Carabaffe", "Tortank", "Chenipan", "Chrysacier", "Papilusion", "Aspicot", "Coconfort",
    "Dardargnan", "Roucool", "Roucoups", "Roucarnage", "Rattata", "Rattatac", "Piafabec",
    "Rapasdepic", "Abo", "Arbok", "Pikachu", "Raichu", "Sabelette", "Sablaireau", "Mélofée",
    "Mélodelfe", "Goupix", "Feunard", "Rondoudou", "Grodoudou", "Nosferapti", "Nosferalto",
    "Mystherbe", "Ortide", "Rafflesia", "Paras", "Parasect", "Mimitoss", "Aéromite", "Taupiqueur",
    "Triopikeur", "Miaouss", "Persian", "Psykokwak", "Akwakwak", "Férosinge", "Colossinge",
    "Caninos", "Arcanin", "Ptitard", "Têtarte", "Tartard", "Abra", "Kadabra", "Alakazam",
    "Machoc", "Machopeur", "Mackogneur", "Chétiflor", "Boustiflor", "Empiflor", "Tentacool",
    "Racaillou", "Gravalanch", "Grolem", "Ponyta", "Galopa", "Ramoloss", "Flagadoss", "Magnéti",
    "Canarticho", "Doduo", "Otaria", "Tadmorv", "Kokiyas", "Fantominus", "Spectrum", "Ectoplasma",
    "Onix", "Soporifik", "Krabby", "Voltorbe", "Noeunoeuf", "Osselait", "Kicklee", "Tygnon",
    "Excelangue", "Smogo", "Rhinocorne", "Leveinard", "Saquedeneu", "Kangourex", "Hypotrempe",
    "Poissirène", "Stari", "Insécateur", "Lippoutou", "Magicarpe", "Léviator", "Lokhlass",
    "Métamorph", "Évoli", "Porygon", "Ronflex", "Artikodin", "Électhor", "Sulfura", "Minidraco",
    "Mewtwo", "Mew",
];

const ADJECTIVES: &[&str] = &[
    "alcoolique", "bourré", "content", "découpé", "dépressif", "drogué", "en slip", "fatigué",
    "flatulent", "froussard", "gluant", "hargneux", "inquiet", "jovial", "marrant", "mystique",
    "nostalgique", "obscène", "paresseux", "pensif", "perplexe", "râleur", "rêveur", "sauvage",
    "suspicieux", "timide", "transpirant", "vénère", "visqueux", "zen",
];

const JOBS: &[&str] = &[
    "plumber", "astronaut", "baker", "tax inspector", "clown", "philosopher", "sysadmin",
    "lighthouse keeper", "dentist", "beekeeper", "ghost hunter", "sommelier",
];

const CITIES: &[&str] = &[
    "Paris", "Lyon", "Marseille", "Brest", "Lille", "Nantes", "Montréal", "Bruxelles", "Genève",
    "Dakar", "Toulouse", "Strasbourg",
];

const ORIENTATIONS: &[&str] = &["hetero", "gay", "bi", "pan", "ace", "curious"];

/// Number of voices the renderer offers.
pub const VOICE_COUNT: u8 = 7;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Profile {
    pub job: &'static str,
    pub age: u8,
    pub city: &'static str,
    pub orientation: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Persona {
    pub name: &'static str,
    pub adjective: &'static str,
    /// `#rrggbb`
    pub color: String,
    /// 1-based index into the creature sprite sheet.
    pub image_id: u16,
    pub profile: Profile,
}

impl Persona {
    pub fn fullname(&self) -> String {
        format!("{} {}", self.name, self.adjective)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PersonaParams {
    pub name: String,
    pub img: String,
    pub color: String,
    pub adjective: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub you: Option<bool>,
}

/// A user as listed to clients.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserInfo {
    pub userid: String,
    pub params: PersonaParams,
    pub profile: Profile,
}

/// Derive the persona and voice of an identity.
pub fn derive(hash: &IdentityHash) -> (Persona, VoiceParams) {
    let h = hash.as_bytes();
    let creature = (h[2] as usize | (h[3] as usize) << 8) % CREATURES.len();
    let persona = Persona {
        name: CREATURES[creature],
        adjective: ADJECTIVES[h[6] as usize % ADJECTIVES.len()],
        color: hsv_to_hex(h[4] as f64 / 255.0, 0.8, 0.9),
        image_id: creature as u16 + 1,
        profile: Profile {
            job: JOBS[h[7] as usize % JOBS.len()],
            age: h[8] % 50 + 18,
            city: CITIES[h[9] as usize % CITIES.len()],
            orientation: ORIENTATIONS[h[10] as usize % ORIENTATIONS.len()],
        },
    };
    let voice = VoiceParams {
        speed: (h[5] % 80) as u16 + 90,
        pitch: (h[0] % 100) as u16,
        voice_id: h[1] % VOICE_COUNT,
    };
    (persona, voice)
}

fn hsv_to_hex(h: f64, s: f64, v: f64) -> String {
    let i = (h * 6.0).floor();
    let f = h * 6.0 - i;
    let p = v * (1.0 - s);
    let q = v * (1.0 - s * f);
    let t = v * (1.0 - s * (1.0 - f));
    let (r, g, b) = match (i as i64).rem_euclid(6) {
        0 => (v, t, p),
        1 => (q, v, p),
        2 => (p, v, t),
        3 => (p, q, v),
        4 => (t, p, v),
        _ => (v, p, q),
    };
    format!(
        "#{:02x}{:02x}{:02x}",
        (r * 255.0).round() as u8,
        (g * 255.0).round() as u8,
        (b * 255.0).round() as u8
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::identity::IdentityResolver;

    #[test]
    fn derivation_is_stable() {
        let resolver = IdentityResolver::new("salt");
        let hash = resolver.resolve("cookie");
        assert_eq!(derive(&hash), derive(&resolver.resolve("cookie")));
    }

    #[test]
    fn voice_ranges() {
        let resolver = IdentityResolver::new("salt");
        for i in 0..200 {
            let (persona, voice) = derive(&resolver.resolve(&format!("c{}", i)));
            assert!((90..170).contains(&voice.speed));
            assert!(voice.pitch < 100);
            assert!(voice.voice_id < VOICE_COUNT);
            assert!(persona.color.starts_with('#') && persona.color.len() == 7);
            assert!((18..68).contains(&persona.profile.age));
        }
    }

    #[test]
    fn hsv_primaries() {
        assert_eq!(hsv_to_hex(0.0, 1.0, 1.0), "#ff0000");
        assert_eq!(hsv_to_hex(0.5, 1.0, 1.0), "#00ffff");
    }
}
