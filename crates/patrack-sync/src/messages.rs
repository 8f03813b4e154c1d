use patrack_storage::NetworkErrorKind;

use crate::Language;

const MAX_LISTED_INSTITUTIONS: usize = 5;

/// Operator-facing text, rendered in the configured language.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message<'a> {
    PageFetchFailed(NetworkErrorKind),
    DownloadInterrupted(NetworkErrorKind),
    ApplyRemoteChanges { change_count: usize },
    CatalogUpToDate,
    RemoteFileRejected { file_name: &'a str, reason: &'a str },
    ReplaceFile { file_name: &'a str },
    NewInstitutions { names: &'a [String] },
    UploadCancelled { file_name: &'a str },
    InvalidFileType { file_name: &'a str },
    InvalidFileFormat { file_name: &'a str, reason: &'a str },
    UploadComplete { file_name: &'a str, rows: usize },
    ProcessingError { file_name: &'a str, reason: &'a str },
    EntryRemoved { name: &'a str },
    RegistrySaveFailed { reason: &'a str },
}

impl Message<'_> {
    pub fn render(&self, language: Language) -> String {
        let english = language == Language::English;
        match self {
            Message::PageFetchFailed(kind) => page_fetch_failed(*kind, english).to_string(),
            Message::DownloadInterrupted(kind) => download_interrupted(*kind, english).to_string(),
            Message::ApplyRemoteChanges { change_count } => {
                let n = *change_count;
                if english {
                    format!(
                        "There {} {n} {} to update in the database. Would you like to do the update now?",
                        if n == 1 { "is" } else { "are" },
                        if n == 1 { "file" } else { "files" }
                    )
                } else {
                    format!(
                        "Il y a {n} {} à mettre à jour dans la base de données. Souhaitez-vous effectuer la mise à jour maintenant ?",
                        if n == 1 { "fichier" } else { "fichiers" }
                    )
                }
            }
            Message::CatalogUpToDate => {
                if english {
                    "The catalog is already up to date.".to_string()
                } else {
                    "Le catalogue est déjà à jour.".to_string()
                }
            }
            Message::RemoteFileRejected { file_name, reason } => {
                if english {
                    format!("{file_name}\nThe file was not in the correct format, so it was not uploaded.\n{reason}")
                } else {
                    format!("{file_name}\nLe fichier n'était pas dans le bon format, il n'a donc pas été chargé.\n{reason}")
                }
            }
            Message::ReplaceFile { file_name } => {
                if english {
                    format!("{file_name}\nA file with the same name is already in the local database. Would you like to replace it with the new file?")
                } else {
                    format!("{file_name}\nUn fichier du même nom se trouve déjà dans la base de données locale. Souhaitez-vous le remplacer par le nouveau fichier ?")
                }
            }
            Message::NewInstitutions { names } => new_institutions(names, english),
            Message::UploadCancelled { file_name } => {
                if english {
                    format!("{file_name}\nThis file will not be uploaded")
                } else {
                    format!("{file_name}\nCe fichier ne sera pas chargé")
                }
            }
            Message::InvalidFileType { file_name } => {
                if english {
                    format!("{file_name}\nSelect only valid xlsx, csv or tsv files.")
                } else {
                    format!("{file_name}\nSélectionnez uniquement les fichiers xlsx, csv ou tsv valides.")
                }
            }
            Message::InvalidFileFormat { file_name, reason } => {
                if english {
                    format!("{file_name}\n{reason}\nUpload aborted.")
                } else {
                    format!("{file_name}\n{reason}\nChargement interrompu.")
                }
            }
            Message::UploadComplete { file_name, rows } => {
                if english {
                    format!("{file_name}\nYour file has been uploaded. {rows} rows have been added.")
                } else {
                    format!("{file_name}\nVotre fichier a été chargé. {rows} lignes ont été ajoutées.")
                }
            }
            Message::ProcessingError { file_name, reason } => {
                if english {
                    format!("{file_name}\nAn error occurred during file processing: {reason}")
                } else {
                    format!("{file_name}\nUne erreur s'est produite lors du traitement du fichier: {reason}")
                }
            }
            Message::EntryRemoved { name } => {
                if english {
                    format!("{name} has been removed from the local database.")
                } else {
                    format!("{name} a été supprimé de la base de données locale.")
                }
            }
            Message::RegistrySaveFailed { reason } => {
                if english {
                    format!("The institution list could not be saved: {reason}")
                } else {
                    format!("La liste des établissements n'a pas pu être enregistrée : {reason}")
                }
            }
        }
    }
}

fn page_fetch_failed(kind: NetworkErrorKind, english: bool) -> &'static str {
    match (kind, english) {
        (NetworkErrorKind::HttpStatus, true) => "Server Connection Error: Please make sure you are connected to your internet and the catalog URL is updated in the settings.",
        (NetworkErrorKind::HttpStatus, false) => "Erreur de connexion au serveur : Veuillez vous assurer que vous êtes connecté à votre internet et que l'URL du catalogue est mise à jour dans les paramètres.",
        (NetworkErrorKind::ConnectionRefused, true) => "Internet Connection Error: Please make sure you are connected to your internet.",
        (NetworkErrorKind::ConnectionRefused, false) => "Erreur de connexion Internet : Veuillez vous assurer que vous êtes connecté à votre internet.",
        (NetworkErrorKind::Timeout, true) => "Connection Timeout: Please try again later.",
        (NetworkErrorKind::Timeout, false) => "Délai de connexion dépassé : Veuillez essayer de mettre à jour le catalogue à nouveau.",
        (NetworkErrorKind::Unexpected, true) => "Unexpected Error: Please make sure you are connected to the internet.",
        (NetworkErrorKind::Unexpected, false) => "Erreur inattendue : Veuillez réessayer plus tard.",
    }
}

fn download_interrupted(kind: NetworkErrorKind, english: bool) -> &'static str {
    match (kind, english) {
        (NetworkErrorKind::HttpStatus, true) => "Internet Connection Error: Connection to the server was lost. Not all files have been successfully retrieved. Please try updating the catalog again.",
        (NetworkErrorKind::HttpStatus, false) => "Erreur de connexion Internet : La connexion au serveur a été perdue. Tous les fichiers n'ont pas été récupérés. Veuillez réessayer de mettre à jour le catalogue.",
        (NetworkErrorKind::ConnectionRefused, true) => "Internet Connection Error: Connection to the internet was lost. Not all files have been successfully retrieved. Please try updating the catalog again.",
        (NetworkErrorKind::ConnectionRefused, false) => "Erreur de connexion Internet : La connexion à l'internet a été perdue. Tous les fichiers n'ont pas été récupérés avec succès. Veuillez réessayer de mettre à jour le catalogue.",
        (NetworkErrorKind::Timeout, true) => "Connection Timeout: The server took too long to respond. Not all files have been successfully retrieved. Please try updating the catalog again.",
        (NetworkErrorKind::Timeout, false) => "Expiration de la connexion : Le serveur a mis trop de temps à répondre. Tous les fichiers n'ont pas été récupérés avec succès. Veuillez réessayer de mettre à jour le catalogue.",
        (NetworkErrorKind::Unexpected, true) => "Unexpected Error: Not all files have been successfully retrieved. Please try updating the catalog again.",
        (NetworkErrorKind::Unexpected, false) => "Erreur inattendue : Tous les fichiers n'ont pas été récupérés. Veuillez réessayer plus tard.",
    }
}

fn new_institutions(names: &[String], english: bool) -> String {
    let mut listed = names
        .iter()
        .take(MAX_LISTED_INSTITUTIONS)
        .cloned()
        .collect::<Vec<_>>()
        .join("\n");
    if names.len() > MAX_LISTED_INSTITUTIONS {
        listed.push_str("...");
    }

    let plural = names.len() > 1;
    if english {
        format!(
            "{} institution name{} found that {verb} not a known catalog institution and {verb} not on the list of local institutions.\n\n{listed}\n\
             Would you like to add them to the local list?\n'No' - The file will not be uploaded.\n'Yes' - The file will be uploaded, and the new institution names will be added as options.",
            names.len(),
            if plural { "s" } else { "" },
            verb = if plural { "are" } else { "is" },
        )
    } else {
        format!(
            "{} nom{} d'établissement {} qui ne {} ni dans le catalogue ni dans la liste des établissements locaux.\n\n{listed}\n\
             Souhaitez-vous les ajouter à la liste locale ?\n'Non' - Le fichier ne sera pas chargé.\n'Oui' - Le fichier sera chargé et les nouveaux noms seront ajoutés comme options.",
            names.len(),
            if plural { "s" } else { "" },
            if plural { "trouvés" } else { "trouvé" },
            if plural { "figurent" } else { "figure" },
        )
    }
}
