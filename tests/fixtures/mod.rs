//! Image bytes and model replies for pipeline tests

#![allow(dead_code)]

use serde_json::{json, Value};

/// PNG signature; enough for format sniffing.
pub const PNG_MAGIC: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];

/// JPEG SOI marker followed by an APP0 marker.
pub const JPEG_MAGIC: &[u8] = &[0xFF, 0xD8, 0xFF, 0xE0];

/// A promotion photo on disk and the label the model should return for it.
#[derive(Debug, Clone)]
pub struct PromoFixture {
    pub path: &'static str,
    pub label: fn() -> Value,
    pub description: &'static str,
}

pub fn butter_label() -> Value {
    json!({
        "name": "Masło Extra Łaciate 200 g",
        "price": 6.99,
        "promo": "NONE",
        "promo_args": ""
    })
}

pub fn beer_label() -> Value {
    json!({
        "name": "Piwo Tyskie Gronie puszka 0,5 l",
        "price": 3.49,
        "promo": "BXYG",
        "promo_args": "2:1"
    })
}

pub fn coffee_label() -> Value {
    json!({
        "name": "Kawa Jacobs Krönung mielona 500 g",
        "price": 29.99,
        "promo": "DISC",
        "promo_args": "40"
    })
}

pub fn water_label() -> Value {
    json!({
        "name": "Woda Żywiec Zdrój niegazowana 1,5 l",
        "price": null,
        "promo": "PACK",
        "promo_args": "6:43"
    })
}

pub fn cheese_label() -> Value {
    json!({
        "name": "Ser Gouda plastry 150 g",
        "price": 4.49,
        "promo": "SUP",
        "promo_args": ""
    })
}

pub const PROMO_FIXTURES: &[PromoFixture] = &[
    PromoFixture {
        path: "promo1.jpg",
        label: butter_label,
        description: "plain price tag",
    },
    PromoFixture {
        path: "BXYG/promo2.png",
        label: beer_label,
        description: "buy two get one free",
    },
    PromoFixture {
        path: "DISC/promo3.jpg",
        label: coffee_label,
        description: "percentage discount",
    },
    PromoFixture {
        path: "PACK/promo4.png",
        label: water_label,
        description: "multipack price, no unit price",
    },
    PromoFixture {
        path: "promo5.png",
        label: cheese_label,
        description: "super price",
    },
];

/// Bytes for a fake image of the given extension whose payload carries `tag`.
pub fn image_bytes(extension: &str, tag: &str) -> Vec<u8> {
    let magic = match extension {
        "png" => PNG_MAGIC,
        _ => JPEG_MAGIC,
    };
    let mut bytes = magic.to_vec();
    bytes.extend_from_slice(tag.as_bytes());
    bytes
}
