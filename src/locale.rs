//! Message catalog for errors stored on feeds and shown to their owners.
//!
//! Templates use `{}` placeholders filled positionally. Unknown languages fall
//! back to [`DEFAULT_LANGUAGE`]; unknown keys render as the key itself.

/// Language used when a user has none or it is not in the catalog.
pub const DEFAULT_LANGUAGE: &str = "en_US";

/// Languages with a catalog.
pub const SUPPORTED_LANGUAGES: [&str; 3] = ["en_US", "fr_FR", "de_DE"];

/// Every message key the engine emits.
pub mod keys {
    pub const FEED_NOT_FOUND: &str = "error.feed_not_found";
    pub const DUPLICATED_FEED: &str = "error.duplicated_feed";
    pub const HTTP_NOT_AUTHORIZED: &str = "error.http_not_authorized";
    pub const HTTP_FORBIDDEN: &str = "error.http_forbidden";
    pub const HTTP_RESOURCE_NOT_FOUND: &str = "error.http_resource_not_found";
    pub const HTTP_INTERNAL_SERVER_ERROR: &str = "error.http_internal_server_error";
    pub const HTTP_BAD_GATEWAY: &str = "error.http_bad_gateway";
    pub const HTTP_SERVICE_UNAVAILABLE: &str = "error.http_service_unavailable";
    pub const HTTP_GATEWAY_TIMEOUT: &str = "error.http_gateway_timeout";
    pub const HTTP_TOO_MANY_REQUESTS: &str = "error.http_too_many_requests";
    pub const HTTP_UNEXPECTED_STATUS_CODE: &str = "error.http_unexpected_status_code";
    pub const HTTP_RESPONSE_TOO_LARGE: &str = "error.http_response_too_large";
    pub const HTTP_EMPTY_RESPONSE_BODY: &str = "error.http_empty_response_body";
    pub const HTTP_BODY_READ: &str = "error.http_body_read";
    pub const HTTP_CLIENT_ERROR: &str = "error.http_client_error";
    pub const TLS_ERROR: &str = "error.tls_error";
    pub const NETWORK_OPERATION: &str = "error.network_operation";
    pub const NETWORK_TIMEOUT: &str = "error.network_timeout";
    pub const FEED_FORMAT_NOT_DETECTED: &str = "error.feed_format_not_detected";
    pub const UNABLE_TO_PARSE_FEED: &str = "error.unable_to_parse_feed";
    pub const ENTRY_PROCESSING: &str = "error.entry_processing";
    pub const DATABASE_ERROR: &str = "error.database_error";
    pub const REQUEST_CANCELLED: &str = "error.request_cancelled";

    /// All keys, used to check catalog completeness.
    pub const ALL: [&str; 23] = [
        FEED_NOT_FOUND,
        DUPLICATED_FEED,
        HTTP_NOT_AUTHORIZED,
        HTTP_FORBIDDEN,
        HTTP_RESOURCE_NOT_FOUND,
        HTTP_INTERNAL_SERVER_ERROR,
        HTTP_BAD_GATEWAY,
        HTTP_SERVICE_UNAVAILABLE,
        HTTP_GATEWAY_TIMEOUT,
        HTTP_TOO_MANY_REQUESTS,
        HTTP_UNEXPECTED_STATUS_CODE,
        HTTP_RESPONSE_TOO_LARGE,
        HTTP_EMPTY_RESPONSE_BODY,
        HTTP_BODY_READ,
        HTTP_CLIENT_ERROR,
        TLS_ERROR,
        NETWORK_OPERATION,
        NETWORK_TIMEOUT,
        FEED_FORMAT_NOT_DETECTED,
        UNABLE_TO_PARSE_FEED,
        ENTRY_PROCESSING,
        DATABASE_ERROR,
        REQUEST_CANCELLED,
    ];
}

fn en_us(key: &str) -> Option<&'static str> {
    let template = match key {
        keys::FEED_NOT_FOUND => "This feed does not exist.",
        keys::DUPLICATED_FEED => "This feed already exists: {}",
        keys::HTTP_NOT_AUTHORIZED => {
            "Access unauthorized, the username or password is probably wrong."
        }
        keys::HTTP_FORBIDDEN => "Access to this website is forbidden.",
        keys::HTTP_RESOURCE_NOT_FOUND => "The resource was not found (HTTP 404).",
        keys::HTTP_INTERNAL_SERVER_ERROR => "The website returned an internal server error.",
        keys::HTTP_BAD_GATEWAY => "The website is unreachable (bad gateway).",
        keys::HTTP_SERVICE_UNAVAILABLE => "The website is temporarily unavailable.",
        keys::HTTP_GATEWAY_TIMEOUT => "The website did not answer in time (gateway timeout).",
        keys::HTTP_TOO_MANY_REQUESTS => {
            "Too many requests sent to this website, retrying in {} seconds."
        }
        keys::HTTP_UNEXPECTED_STATUS_CODE => "Unexpected status code: {}.",
        keys::HTTP_RESPONSE_TOO_LARGE => "The response is larger than {} bytes.",
        keys::HTTP_EMPTY_RESPONSE_BODY => "The response body is empty.",
        keys::HTTP_BODY_READ => "Unable to read the response body: {}",
        keys::HTTP_CLIENT_ERROR => "HTTP client error: {}",
        keys::TLS_ERROR => "TLS error: {}",
        keys::NETWORK_OPERATION => "Network error: {}",
        keys::NETWORK_TIMEOUT => "The website took too long to respond: {}",
        keys::FEED_FORMAT_NOT_DETECTED => "Unable to detect the feed format: {}",
        keys::UNABLE_TO_PARSE_FEED => "Unable to parse this feed: {}",
        keys::ENTRY_PROCESSING => "Unable to process the feed entries: {}",
        keys::DATABASE_ERROR => "Database error: {}",
        keys::REQUEST_CANCELLED => "The refresh was cancelled.",
        _ => return None,
    };
    Some(template)
}

fn fr_fr(key: &str) -> Option<&'static str> {
    let template = match key {
        keys::FEED_NOT_FOUND => "Ce flux n'existe pas.",
        keys::DUPLICATED_FEED => "Ce flux existe déjà : {}",
        keys::HTTP_NOT_AUTHORIZED => {
            "Accès non autorisé, l'identifiant ou le mot de passe est probablement incorrect."
        }
        keys::HTTP_FORBIDDEN => "L'accès à ce site est interdit.",
        keys::HTTP_RESOURCE_NOT_FOUND => "La ressource est introuvable (HTTP 404).",
        keys::HTTP_INTERNAL_SERVER_ERROR => "Le site a renvoyé une erreur interne.",
        keys::HTTP_BAD_GATEWAY => "Le site est injoignable (mauvaise passerelle).",
        keys::HTTP_SERVICE_UNAVAILABLE => "Le site est temporairement indisponible.",
        keys::HTTP_GATEWAY_TIMEOUT => "Le site n'a pas répondu à temps (délai de passerelle).",
        keys::HTTP_TOO_MANY_REQUESTS => {
            "Trop de requêtes envoyées à ce site, nouvel essai dans {} secondes."
        }
        keys::HTTP_UNEXPECTED_STATUS_CODE => "Code de statut inattendu : {}.",
        keys::HTTP_RESPONSE_TOO_LARGE => "La réponse dépasse {} octets.",
        keys::HTTP_EMPTY_RESPONSE_BODY => "Le corps de la réponse est vide.",
        keys::HTTP_BODY_READ => "Impossible de lire le corps de la réponse : {}",
        keys::HTTP_CLIENT_ERROR => "Erreur du client HTTP : {}",
        keys::TLS_ERROR => "Erreur TLS : {}",
        keys::NETWORK_OPERATION => "Erreur réseau : {}",
        keys::NETWORK_TIMEOUT => "Le site a mis trop de temps à répondre : {}",
        keys::FEED_FORMAT_NOT_DETECTED => "Impossible de détecter le format du flux : {}",
        keys::UNABLE_TO_PARSE_FEED => "Impossible d'analyser ce flux : {}",
        keys::ENTRY_PROCESSING => "Impossible de traiter les articles du flux : {}",
        keys::DATABASE_ERROR => "Erreur de base de données : {}",
        keys::REQUEST_CANCELLED => "L'actualisation a été annulée.",
        _ => return None,
    };
    Some(template)
}

fn de_de(key: &str) -> Option<&'static str> {
    let template = match key {
        keys::FEED_NOT_FOUND => "Dieser Feed existiert nicht.",
        keys::DUPLICATED_FEED => "Dieser Feed existiert bereits: {}",
        keys::HTTP_NOT_AUTHORIZED => {
            "Zugriff verweigert, Benutzername oder Passwort sind vermutlich falsch."
        }
        keys::HTTP_FORBIDDEN => "Der Zugriff auf diese Webseite ist verboten.",
        keys::HTTP_RESOURCE_NOT_FOUND => "Die Ressource wurde nicht gefunden (HTTP 404).",
        keys::HTTP_INTERNAL_SERVER_ERROR => "Die Webseite meldet einen internen Serverfehler.",
        keys::HTTP_BAD_GATEWAY => "Die Webseite ist nicht erreichbar (Bad Gateway).",
        keys::HTTP_SERVICE_UNAVAILABLE => "Die Webseite ist vorübergehend nicht verfügbar.",
        keys::HTTP_GATEWAY_TIMEOUT => "Die Webseite hat nicht rechtzeitig geantwortet (Gateway Timeout).",
        keys::HTTP_TOO_MANY_REQUESTS => {
            "Zu viele Anfragen an diese Webseite, neuer Versuch in {} Sekunden."
        }
        keys::HTTP_UNEXPECTED_STATUS_CODE => "Unerwarteter Statuscode: {}.",
        keys::HTTP_RESPONSE_TOO_LARGE => "Die Antwort ist größer als {} Bytes.",
        keys::HTTP_EMPTY_RESPONSE_BODY => "Die Antwort ist leer.",
        keys::HTTP_BODY_READ => "Die Antwort konnte nicht gelesen werden: {}",
        keys::HTTP_CLIENT_ERROR => "HTTP-Client-Fehler: {}",
        keys::TLS_ERROR => "TLS-Fehler: {}",
        keys::NETWORK_OPERATION => "Netzwerkfehler: {}",
        keys::NETWORK_TIMEOUT => "Die Webseite hat zu lange gebraucht: {}",
        keys::FEED_FORMAT_NOT_DETECTED => "Das Feed-Format konnte nicht erkannt werden: {}",
        keys::UNABLE_TO_PARSE_FEED => "Dieser Feed konnte nicht gelesen werden: {}",
        keys::ENTRY_PROCESSING => "Die Artikel des Feeds konnten nicht verarbeitet werden: {}",
        keys::DATABASE_ERROR => "Datenbankfehler: {}",
        keys::REQUEST_CANCELLED => "Die Aktualisierung wurde abgebrochen.",
        _ => return None,
    };
    Some(template)
}

fn template(language: &str, key: &str) -> Option<&'static str> {
    match language {
        "fr_FR" => fr_fr(key),
        "de_DE" => de_de(key),
        _ => en_us(key),
    }
    .or_else(|| en_us(key))
}

/// Renders `key` in `language`, substituting `args` in order.
#[must_use]
pub fn translate(language: &str, key: &str, args: &[String]) -> String {
    let Some(template) = template(language, key) else {
        return key.to_string();
    };

    let mut out = String::with_capacity(template.len() + 16);
    let mut args = args.iter();
    let mut parts = template.split("{}").peekable();
    while let Some(part) = parts.next() {
        out.push_str(part);
        if parts.peek().is_some() {
            match args.next() {
                Some(arg) => out.push_str(arg),
                None => out.push_str("{}"),
            }
        }
    }
    out
}
