use graphorm::property::{Property, PropertyKind};
use graphorm::Value;
use proptest::prelude::*;
use time::{Date, Month, PrimitiveDateTime, Time};

fn arb_date() -> impl Strategy<Value = Date> {
    (1000i32..=9999, 1u8..=12, 1u8..=28).prop_map(|(year, month, day)| {
        let month = Month::try_from(month).unwrap();
        Date::from_calendar_date(year, month, day).unwrap()
    })
}

fn arb_datetime() -> impl Strategy<Value = PrimitiveDateTime> {
    (arb_date(), 0u8..24, 0u8..60, 0u8..60, 0u32..1_000_000).prop_map(|(date, h, m, s, micro)| {
        PrimitiveDateTime::new(date, Time::from_hms_micro(h, m, s, micro).unwrap())
    })
}

fn round_trip(prop: &Property, value: Value) {
    let stored = prop.to_stored(&value).unwrap();
    assert_eq!(prop.from_stored(&stored).unwrap(), value);
}

fn key(prop: &Property, value: Value) -> String {
    prop.to_index_key(&value).unwrap().unwrap()
}

#[test]
fn negative_integers_sort_before_positive_ones() {
    let prop = Property::integer().indexed();
    let keys: Vec<String> = [i64::MIN, -10, -1, 0, 1, 10, i64::MAX]
        .into_iter()
        .map(|v| key(&prop, Value::Int(v)))
        .collect();
    let mut sorted = keys.clone();
    sorted.sort();
    assert_eq!(keys, sorted);
    assert!(keys.iter().all(|k| k.len() == keys[0].len()));
    assert_eq!(prop.min_key(), keys[0]);
    assert_eq!(prop.max_key(), keys[6]);
}

#[test]
fn null_has_no_index_key() {
    let prop = Property::string().indexed().null();
    assert_eq!(prop.to_index_key(&Value::Null).unwrap(), None);
    assert!(prop.index_keys(&Value::Null).unwrap().is_empty());
}

#[test]
fn array_elements_are_keyed_individually() {
    let prop = Property::array(PropertyKind::Integer).indexed();
    let keys = prop
        .index_keys(&Value::List(vec![Value::Int(3), Value::Null, Value::Int(-3)]))
        .unwrap();
    assert_eq!(keys.len(), 2);
    assert_eq!(keys[0], key(&Property::integer(), Value::Int(3)));
}

proptest! {
    #[test]
    fn integers_round_trip(v in any::<i64>()) {
        round_trip(&Property::integer(), Value::Int(v));
    }

    #[test]
    fn strings_round_trip(s in "\\PC*") {
        round_trip(&Property::string(), Value::String(s));
    }

    #[test]
    fn floats_round_trip(f in -1.0e12f64..1.0e12) {
        round_trip(&Property::float(), Value::Float(f));
    }

    #[test]
    fn dates_round_trip(date in arb_date()) {
        round_trip(&Property::date(), Value::Date(date));
    }

    #[test]
    fn datetimes_round_trip(at in arb_datetime()) {
        round_trip(&Property::datetime(), Value::DateTime(at));
    }

    #[test]
    fn joined_arrays_round_trip(parts in prop::collection::vec("[a-z,\\\\]{1,6}", 0..5)) {
        let prop = Property::joined_array(PropertyKind::String, ',');
        round_trip(&prop, Value::List(parts.into_iter().map(Value::String).collect()));
    }

    #[test]
    fn native_arrays_round_trip(items in prop::collection::vec(any::<i64>(), 0..8)) {
        let prop = Property::array(PropertyKind::Integer);
        round_trip(&prop, Value::List(items.into_iter().map(Value::Int).collect()));
    }

    #[test]
    fn integer_keys_follow_numeric_order(a in any::<i64>(), b in any::<i64>()) {
        let prop = Property::integer().indexed();
        let (ka, kb) = (key(&prop, Value::Int(a)), key(&prop, Value::Int(b)));
        prop_assert_eq!(a.cmp(&b), ka.cmp(&kb));
    }

    #[test]
    fn date_keys_follow_calendar_order(a in arb_date(), b in arb_date()) {
        let prop = Property::date().indexed();
        let (ka, kb) = (key(&prop, Value::Date(a)), key(&prop, Value::Date(b)));
        prop_assert_eq!(a.cmp(&b), ka.cmp(&kb));
    }

    #[test]
    fn datetime_keys_follow_time_order(a in arb_datetime(), b in arb_datetime()) {
        let prop = Property::datetime().indexed();
        let (ka, kb) = (key(&prop, Value::DateTime(a)), key(&prop, Value::DateTime(b)));
        prop_assert_eq!(a.cmp(&b), ka.cmp(&kb));
    }
}
